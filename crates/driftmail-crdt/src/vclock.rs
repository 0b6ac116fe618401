//! Vector clocks and the causal-delivery test.
//!
//! Each replica keeps one counter per known replica name. A replica's own
//! entry increments by one for every locally originated update, and the
//! full map accompanies every outbound message. Clocks persist across
//! restarts alongside the outbound log.

use driftmail_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// A mapping from replica name to a monotonically non-decreasing counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    #[serde(flatten)]
    counters: BTreeMap<String, u32>,
}

impl VectorClock {
    /// Empty clock (all counters implicitly zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `replica`; absent entries read as zero.
    pub fn get(&self, replica: &str) -> u32 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// Advance this replica's own entry by one.
    pub fn increment(&mut self, replica: &str) {
        *self.counters.entry(replica.to_string()).or_insert(0) += 1;
    }

    /// Pointwise maximum with `other`, applied on delivery.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &counter) in &other.counters {
            let entry = self.counters.entry(replica.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Classic causal-delivery test: a message from `sender` stamped with
    /// `incoming` is deliverable against this local clock iff it is the
    /// next message from the sender and everything it causally depends on
    /// has already been delivered here.
    pub fn delivers(&self, sender: &str, incoming: &VectorClock) -> bool {
        if incoming.get(sender) != self.get(sender) + 1 {
            return false;
        }
        incoming
            .counters
            .iter()
            .filter(|(replica, _)| replica.as_str() != sender)
            .all(|(replica, &counter)| counter <= self.get(replica))
    }

    /// Iterate over the known (replica, counter) entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counters.iter().map(|(r, &c)| (r.as_str(), c))
    }

    /// Persist the clock atomically (sibling tempfile, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to serialize clock: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| Error::Storage(format!("failed to create clock tempfile: {}", e)))?;
        tmp.write_all(&serialized)
            .and_then(|_| tmp.sync_all())
            .map_err(|e| Error::Storage(format!("failed to write clock tempfile: {}", e)))?;

        std::fs::rename(&tmp_path, path)
            .map_err(|e| Error::Storage(format!("failed to swap clock file: {}", e)))
    }

    /// Load a persisted clock; a missing file reads as the empty clock.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)
            .map_err(|e| Error::Storage(format!("failed to read clock file: {}", e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Storage(format!("failed to parse clock file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clock(entries: &[(&str, u32)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (replica, counter) in entries {
            for _ in 0..*counter {
                c.increment(replica);
            }
        }
        c
    }

    #[test]
    fn test_increment_and_get() {
        let mut c = VectorClock::new();
        assert_eq!(c.get("r1"), 0);
        c.increment("r1");
        c.increment("r1");
        assert_eq!(c.get("r1"), 2);
        assert_eq!(c.get("r2"), 0);
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut local = clock(&[("r1", 3), ("r2", 1)]);
        let incoming = clock(&[("r2", 4), ("r3", 2)]);
        local.merge(&incoming);
        assert_eq!(local.get("r1"), 3);
        assert_eq!(local.get("r2"), 4);
        assert_eq!(local.get("r3"), 2);
    }

    #[test]
    fn test_next_in_sender_order_delivers() {
        let local = clock(&[("r1", 1)]);
        let incoming = clock(&[("r1", 2)]);
        assert!(local.delivers("r1", &incoming));
    }

    #[test]
    fn test_sender_gap_defers() {
        let local = VectorClock::new();
        let incoming = clock(&[("r1", 2)]);
        assert!(!local.delivers("r1", &incoming));
    }

    #[test]
    fn test_causal_dependency_defers() {
        // m2 from r2 was sent after r2 saw r1's first update; a receiver
        // that has not applied that update yet must hold m2 back.
        let m2 = clock(&[("r1", 1), ("r2", 1)]);

        let before_m1 = VectorClock::new();
        assert!(!before_m1.delivers("r2", &m2));

        let after_m1 = clock(&[("r1", 1)]);
        assert!(after_m1.delivers("r2", &m2));
    }

    #[test]
    fn test_duplicate_is_not_deliverable() {
        let local = clock(&[("r1", 2)]);
        let incoming = clock(&[("r1", 2)]);
        assert!(!local.delivers("r1", &incoming));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clock.json");

        let saved = clock(&[("r1", 7), ("r2", 3)]);
        saved.save(&path).unwrap();

        let loaded = VectorClock::load_or_default(&path).unwrap();
        assert_eq!(loaded, saved);

        let missing = VectorClock::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, VectorClock::new());
    }
}
