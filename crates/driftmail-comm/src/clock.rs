//! Shared handle on the replica's persistent vector clock.
//!
//! The sender ticks the clock when stamping an outbound update; the
//! receiver merges remote clocks on delivery. Both go through this handle
//! so every change hits the same durable file.

use driftmail_common::Result;
use driftmail_crdt::VectorClock;
use std::path::PathBuf;
use std::sync::Mutex;

/// The replica's vector clock bound to its on-disk location.
#[derive(Debug)]
pub struct ClockHandle {
    path: PathBuf,
    inner: Mutex<VectorClock>,
}

impl ClockHandle {
    /// Load the persisted clock, or start from the empty clock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let clock = VectorClock::load_or_default(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(clock),
        })
    }

    /// Advance `replica`'s own entry, persist, and return the stamped
    /// clock for the outgoing message.
    pub fn tick(&self, replica: &str) -> Result<VectorClock> {
        let mut clock = self.inner.lock().expect("clock lock poisoned");
        clock.increment(replica);
        clock.save(&self.path)?;
        Ok(clock.clone())
    }

    /// Merge a delivered message's clock into the local clock and persist.
    pub fn observe(&self, incoming: &VectorClock) -> Result<()> {
        let mut clock = self.inner.lock().expect("clock lock poisoned");
        clock.merge(incoming);
        clock.save(&self.path)
    }

    /// Causal-delivery test against the current local clock.
    pub fn delivers(&self, sender: &str, incoming: &VectorClock) -> bool {
        self.inner
            .lock()
            .expect("clock lock poisoned")
            .delivers(sender, incoming)
    }

    /// Current clock value.
    pub fn snapshot(&self) -> VectorClock {
        self.inner.lock().expect("clock lock poisoned").clone()
    }
}
