//! Observed-Remove Set (OR-Set).
//!
//! A CRDT set in which every add mints a unique tag and a remove only
//! affects the tags observed by the remover. Concurrent adds of the same
//! value therefore survive a concurrent remove (add-wins semantics).
//!
//! Each set is bound to a durable log file. The log is a single line of
//! `;`-separated tokens, alternating base64-encoded values and textual
//! UUID tags: `val0;tag0;val1;tag1;…`. Every state-changing mutation is
//! flushed to the log before it is acknowledged to the caller, so the file
//! is a faithful projection of the in-memory map at all times.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::{DecodeError, Engine};
use driftmail_common::types::{mint_tag, ElementTag};
use driftmail_common::{Error, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// An OR-Set bound to a durable log file.
///
/// The internal lock serializes all mutations of one set; handlers working
/// on different users or mailboxes never contend on it.
#[derive(Debug)]
pub struct OrSet {
    path: PathBuf,
    elements: Mutex<HashMap<ElementTag, String>>,
}

impl OrSet {
    /// Open the set backed by `path`: parse the log if it exists,
    /// otherwise create an empty one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Self::from_file(path);
        }

        File::create(&path)
            .and_then(|f| f.sync_all())
            .map_err(|e| Error::Storage(format!("failed to create CRDT file: {}", e)))?;

        Ok(Self {
            path,
            elements: Mutex::new(HashMap::new()),
        })
    }

    /// Parse an existing log file into a set.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("failed to read CRDT file: {}", e)))?;

        let contents = raw.strip_suffix('\n').unwrap_or(&raw);

        let mut elements = HashMap::new();
        if !contents.is_empty() {
            let tokens: Vec<&str> = contents.split(';').collect();
            if tokens.len() % 2 != 0 {
                return Err(Error::OddElementCount {
                    path: path.display().to_string(),
                });
            }

            for pair in tokens.chunks_exact(2) {
                let decoded = BASE64.decode(pair[0]).map_err(|e| Error::CrdtDecode {
                    path: path.display().to_string(),
                    inner: render_decode_error(&e),
                })?;
                let value = String::from_utf8(decoded).map_err(|e| {
                    Error::Storage(format!("CRDT value is not valid UTF-8: {}", e))
                })?;
                elements.insert(pair[1].to_string(), value);
            }
        }

        Ok(Self {
            path,
            elements: Mutex::new(elements),
        })
    }

    /// True iff at least one tag maps to `value`.
    pub fn lookup(&self, value: &str) -> bool {
        self.elements
            .lock()
            .expect("OR-Set lock poisoned")
            .values()
            .any(|v| v == value)
    }

    /// Number of (tag, value) observations in the set.
    pub fn len(&self) -> usize {
        self.elements.lock().expect("OR-Set lock poisoned").len()
    }

    /// True iff no observation is present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the tag→value map.
    pub fn elements(&self) -> HashMap<ElementTag, String> {
        self.elements.lock().expect("OR-Set lock poisoned").clone()
    }

    /// Distinct values currently in the set.
    pub fn values(&self) -> Vec<String> {
        let guard = self.elements.lock().expect("OR-Set lock poisoned");
        let mut values: Vec<String> = guard.values().cloned().collect();
        values.sort();
        values.dedup();
        values
    }

    /// Add `value` under a freshly minted tag and persist the observation.
    ///
    /// Returns the minted tag so the caller can compose the outbound
    /// update carrying it. The set's lock is held from mint to durable
    /// append; no intermediate state is observable.
    pub fn add(&self, value: &str) -> Result<ElementTag> {
        let mut guard = self.elements.lock().expect("OR-Set lock poisoned");
        let tag = mint_tag();
        self.insert_locked(&mut guard, value, &tag, true)?;
        Ok(tag)
    }

    /// Insert `(tag, value)`; append to the log when `persist` is set.
    pub fn add_effect(&self, value: &str, tag: &str, persist: bool) -> Result<()> {
        let mut guard = self.elements.lock().expect("OR-Set lock poisoned");
        self.insert_locked(&mut guard, value, tag, persist)
    }

    /// Remove every tag currently bound to `value` and persist.
    ///
    /// Fails with `ElementNotFound` when no tag maps to `value`. Returns
    /// the removed `(tag, value)` pairs so the caller can compose the
    /// outbound update; tags added concurrently elsewhere are unaffected.
    pub fn remove(&self, value: &str) -> Result<Vec<(ElementTag, String)>> {
        let mut guard = self.elements.lock().expect("OR-Set lock poisoned");

        let removed: Vec<(ElementTag, String)> = guard
            .iter()
            .filter(|(_, v)| v.as_str() == value)
            .map(|(t, v)| (t.clone(), v.clone()))
            .collect();

        if removed.is_empty() {
            return Err(Error::ElementNotFound);
        }

        for (tag, _) in &removed {
            guard.remove(tag);
        }
        self.rewrite_locked(&guard)?;

        Ok(removed)
    }

    /// Delete every listed tag; missing tags are silently ignored.
    /// When `persist` is set the whole log is rewritten atomically.
    pub fn remove_effect(&self, pairs: &[(ElementTag, String)], persist: bool) -> Result<()> {
        let mut guard = self.elements.lock().expect("OR-Set lock poisoned");

        for (tag, _) in pairs {
            guard.remove(tag);
        }

        if persist {
            self.rewrite_locked(&guard)?;
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        guard: &mut HashMap<ElementTag, String>,
        value: &str,
        tag: &str,
        persist: bool,
    ) -> Result<()> {
        let first_entry = guard.is_empty();
        let previous = guard.insert(tag.to_string(), value.to_string());

        if persist {
            let mut entry = String::new();
            if !first_entry {
                entry.push(';');
            }
            entry.push_str(&BASE64.encode(value));
            entry.push(';');
            entry.push_str(tag);

            // A failed append must not leave the map ahead of the log.
            if let Err(e) = self.append_entry(&entry) {
                match previous {
                    Some(v) => guard.insert(tag.to_string(), v),
                    None => guard.remove(tag),
                };
                return Err(e);
            }
        }
        Ok(())
    }

    fn append_entry(&self, entry: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(format!("failed to open CRDT file: {}", e)))?;
        file.write_all(entry.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::Storage(format!("failed to append to CRDT file: {}", e)))
    }

    /// Rewrite the log from the in-memory map: sibling tempfile, fsync,
    /// rename. A concurrent recovery path never observes a torn file.
    fn rewrite_locked(&self, guard: &HashMap<ElementTag, String>) -> Result<()> {
        let serialized = guard
            .iter()
            .map(|(tag, value)| format!("{};{}", BASE64.encode(value), tag))
            .collect::<Vec<_>>()
            .join(";");

        let tmp_path = sibling_temp_path(&self.path);
        let mut tmp = File::create(&tmp_path)
            .map_err(|e| Error::Storage(format!("failed to create CRDT tempfile: {}", e)))?;
        tmp.write_all(serialized.as_bytes())
            .and_then(|_| tmp.sync_all())
            .map_err(|e| Error::Storage(format!("failed to write CRDT tempfile: {}", e)))?;

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Storage(format!("failed to swap CRDT file: {}", e)))
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Render a base64 decode failure the way the recovery path reports it,
/// naming the offending byte offset.
fn render_decode_error(err: &DecodeError) -> String {
    let offset = match err {
        DecodeError::InvalidByte(offset, _) => *offset,
        DecodeError::InvalidLastSymbol(offset, _) => *offset,
        DecodeError::InvalidLength(_) | DecodeError::InvalidPadding => 0,
    };
    format!("illegal base64 data at input byte {}", offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test-crdt.log")
    }

    #[test]
    fn test_from_file_accepts_empty_log() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);

        std::fs::write(&path, "").unwrap();
        let set = OrSet::from_file(&path).unwrap();
        assert!(set.is_empty());

        std::fs::write(&path, ";\n").unwrap();
        assert!(OrSet::from_file(&path).is_ok());
    }

    #[test]
    fn test_from_file_rejects_odd_token_count() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, "A;B;C\n").unwrap();

        let err = OrSet::from_file(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("odd number of elements in CRDT file '{}'", path.display())
        );
    }

    #[test]
    fn test_from_file_rejects_bad_base64() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, "abc;1;def;2;ghi;3\n").unwrap();

        let err = OrSet::from_file(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "decoding base64 string in CRDT file '{}' failed: \
                 illegal base64 data at input byte 0",
                path.display()
            )
        );
    }

    #[test]
    fn test_from_file_parses_elements() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, "YWJj;1;ZGVm;2;Z2hp;3\n").unwrap();

        let set = OrSet::from_file(&path).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.lookup("abc"));
        assert!(set.lookup("def"));
        assert!(set.lookup("ghi"));
        assert!(!set.lookup("jkl"));
    }

    #[test]
    fn test_log_projection_after_add_effect() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let set = OrSet::open(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        set.add_effect("abc", "1", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "YWJj;1");

        set.add_effect("def", "2", true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(
            contents == "YWJj;1;ZGVm;2" || contents == "ZGVm;2;YWJj;1",
            "unexpected log contents: {}",
            contents
        );
    }

    #[test]
    fn test_log_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let set = OrSet::open(&path).unwrap();

        set.add("Hey there, I am a test.").unwrap();
        set.add("Sending ✉ around the 🌐: ✔").unwrap();
        set.add("666").unwrap();
        set.add("666").unwrap();

        let reloaded = OrSet::from_file(&path).unwrap();
        assert_eq!(reloaded.elements(), set.elements());
    }

    #[test]
    fn test_lookup_handles_multibyte_values() {
        let dir = TempDir::new().unwrap();
        let set = OrSet::open(log_path(&dir)).unwrap();

        let values = ["true", "Sending ✉ around the 🌐: ✔", "12.34", "☕"];
        for value in values {
            assert!(!set.lookup(value));
            set.add_effect(value, &mint_tag(), false).unwrap();
            assert!(set.lookup(value));
        }
    }

    #[test]
    fn test_add_returns_fresh_tags() {
        let dir = TempDir::new().unwrap();
        let set = OrSet::open(log_path(&dir)).unwrap();

        let t1 = set.add("Hey there, I am a test.").unwrap();
        let t2 = set.add("666").unwrap();
        assert_eq!(t1.len(), 36);
        assert_eq!(t2.len(), 36);

        // A second add of a contained value coexists under a new tag.
        let t3 = set.add("Hey there, I am a test.").unwrap();
        assert_ne!(t1, t3);
        assert_eq!(set.len(), 3);
        assert!(set.lookup("Hey there, I am a test."));
    }

    #[test]
    fn test_remove_effect_scope() {
        let dir = TempDir::new().unwrap();
        let set = OrSet::open(log_path(&dir)).unwrap();

        let v2 = "Hey there, I am a test.";
        set.add_effect(v2, "k1", false).unwrap();
        set.add_effect("v3", "k2", false).unwrap();
        set.add_effect("v4", "k3", false).unwrap();
        set.add_effect(v2, "k4", false).unwrap();
        set.add_effect(v2, "k5", false).unwrap();
        set.add_effect(v2, "k6", false).unwrap();

        // Empty remove set and unknown tags are no-ops.
        set.remove_effect(&[], false).unwrap();
        assert_eq!(set.len(), 6);
        set.remove_effect(&[("k0".into(), v2.into())], false).unwrap();
        assert_eq!(set.len(), 6);
        assert!(set.lookup(v2));

        // Removing one of four tags keeps the value observable.
        set.remove_effect(&[("k1".into(), v2.into())], false).unwrap();
        assert_eq!(set.len(), 5);
        assert!(set.lookup(v2));

        // Removing every tag bound to v2 leaves exactly k2 and k3.
        let rset: Vec<(ElementTag, String)> = ["k1", "k4", "k5", "k6"]
            .iter()
            .map(|t| (t.to_string(), v2.to_string()))
            .collect();
        set.remove_effect(&rset, false).unwrap();

        let elements = set.elements();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements["k2"], "v3");
        assert_eq!(elements["k3"], "v4");
        assert!(!set.lookup(v2));

        // Re-adding under a removed tag and replaying the remove converges.
        set.add_effect(v2, "k6", false).unwrap();
        set.remove_effect(&rset, false).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.lookup(v2));
    }

    #[test]
    fn test_remove_missing_value() {
        let dir = TempDir::new().unwrap();
        let set = OrSet::open(log_path(&dir)).unwrap();

        let err = set.remove("true").unwrap_err();
        assert_eq!(err.to_string(), "element to be removed not found in set");
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_collects_observed_tags() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let set = OrSet::open(&path).unwrap();

        let v2 = "Hey there, I am a test.";
        set.add(v2).unwrap();
        set.add("Sending ✉ around the 🌐: ✔").unwrap();
        set.add("666").unwrap();
        set.add(v2).unwrap();
        set.add(v2).unwrap();
        set.add(v2).unwrap();

        let removed = set.remove("Sending ✉ around the 🌐: ✔").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(set.len(), 5);

        let removed = set.remove(v2).unwrap();
        assert_eq!(removed.len(), 4);
        assert_eq!(set.len(), 1);
        assert!(!set.lookup(v2));
        assert!(set.lookup("666"));

        // The rewrite is reflected on disk.
        let reloaded = OrSet::from_file(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.lookup("666"));
    }
}
