//! driftmail Comm - the replication transport
//!
//! Update messages flow from the replica that performed a local IMAP
//! mutation to every peer: the sender stamps each message with the
//! replica's vector clock, logs it durably and ships it over a reliable
//! ordered channel; the receiver buffers incoming messages until they are
//! causally deliverable and confirms each one only after the downstream
//! applier has executed it.

pub mod clock;
pub mod msg;
pub mod receiver;
pub mod sender;
pub mod wire;

pub use clock::ClockHandle;
pub use msg::{Confirmation, Element, Mail, Operation, UpdateMessage, STATUS_OK};
pub use receiver::{ApplyRequest, Receiver};
pub use sender::Sender;
