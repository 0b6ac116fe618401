//! driftmail CRDT - conflict-free primitives for mailbox replication
//!
//! This crate provides the two leaf pieces of the replication layer: the
//! observed-remove set that mailbox state is modelled with, and the vector
//! clocks that order update messages between replicas.

pub mod orset;
pub mod vclock;

pub use orset::OrSet;
pub use vclock::VectorClock;
