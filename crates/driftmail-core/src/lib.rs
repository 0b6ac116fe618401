//! driftmail Core - replicated mailbox state and the IMAP tier
//!
//! This crate owns the per-replica node state (OR-Sets plus the Maildir
//! tree), the downstream applier that executes remote updates against it,
//! the worker-side mutation handlers that originate updates, and the
//! distributor's session state machine.

pub mod applier;
pub mod auth;
pub mod command;
pub mod distributor;
pub mod mailbox;
pub mod maildir;
pub mod node;
pub mod session;
pub mod worker;

pub use auth::{FileAuthenticator, PlainAuthenticator};
pub use distributor::Distributor;
pub use maildir::Maildir;
pub use node::{Node, NodeState};
pub use session::{Session, SessionState};
pub use worker::Worker;
