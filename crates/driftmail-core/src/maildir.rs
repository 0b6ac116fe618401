//! Minimal Maildir surface.
//!
//! One directory per folder with `new`, `cur` and `tmp` subdirectories.
//! The user's INBOX lives directly at the user root; every other mailbox
//! is a subdirectory of it. Replicated deliveries go straight into `cur`
//! and are fsynced before the CRDT observes them.

use driftmail_common::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

const SUBDIRS: [&str; 3] = ["new", "cur", "tmp"];

/// Handle on one Maildir folder.
#[derive(Debug, Clone)]
pub struct Maildir {
    path: PathBuf,
}

impl Maildir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The Maildir of `mailbox` for `user` under `root`. INBOX maps to
    /// the user root itself.
    pub fn for_mailbox(root: &Path, user: &str, mailbox: &str) -> Self {
        if mailbox == "INBOX" {
            Self::new(root.join(user))
        } else {
            Self::new(root.join(user).join(mailbox))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.join("cur").is_dir()
    }

    /// Create the folder with its three subdirectories.
    pub fn create(&self) -> Result<()> {
        for sub in SUBDIRS {
            std::fs::create_dir_all(self.path.join(sub))
                .map_err(|e| Error::Storage(format!("failed to create Maildir: {}", e)))?;
        }
        Ok(())
    }

    /// Remove the folder and everything in it.
    pub fn remove(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.path)
            .map_err(|e| Error::Storage(format!("failed to remove Maildir: {}", e)))
    }

    /// Path of a mail file inside `cur`.
    pub fn mail_path(&self, value: &str) -> PathBuf {
        self.path.join("cur").join(value)
    }

    /// Write a mail file into `cur` and fsync it. A partially written
    /// file is removed before the error is returned.
    pub fn deliver(&self, value: &str, contents: &[u8]) -> Result<()> {
        let path = self.mail_path(value);
        let written = std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(contents).and_then(|_| f.sync_all()));

        if let Err(e) = written {
            let _ = std::fs::remove_file(&path);
            return Err(Error::Storage(format!("failed to deliver mail file: {}", e)));
        }
        Ok(())
    }

    /// Delete a mail file from `cur`.
    pub fn remove_mail(&self, value: &str) -> Result<()> {
        std::fs::remove_file(self.mail_path(value))
            .map_err(|e| Error::Storage(format!("failed to remove mail file: {}", e)))
    }

    /// Read a mail file from `cur`.
    pub fn read_mail(&self, value: &str) -> Result<Vec<u8>> {
        std::fs::read(self.mail_path(value))
            .map_err(|e| Error::Storage(format!("failed to read mail file: {}", e)))
    }

    /// Mail file names in `cur`, lexicographically sorted. Recovery uses
    /// this to rebuild the sequence-number order deterministically.
    pub fn list_cur(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(self.path.join("cur"))
            .map_err(|e| Error::Storage(format!("failed to list Maildir: {}", e)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("failed to list Maildir: {}", e)))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_inbox_maps_to_user_root() {
        let root = Path::new("/mail");
        assert_eq!(
            Maildir::for_mailbox(root, "alice", "INBOX").path(),
            Path::new("/mail/alice")
        );
        assert_eq!(
            Maildir::for_mailbox(root, "alice", "Drafts").path(),
            Path::new("/mail/alice/Drafts")
        );
    }

    #[test]
    fn test_create_deliver_list_remove() {
        let dir = TempDir::new().unwrap();
        let maildir = Maildir::for_mailbox(dir.path(), "alice", "Drafts");

        assert!(!maildir.exists());
        maildir.create().unwrap();
        assert!(maildir.exists());
        for sub in SUBDIRS {
            assert!(maildir.path().join(sub).is_dir());
        }

        maildir.deliver("mail-b", b"second").unwrap();
        maildir.deliver("mail-a", b"first").unwrap();
        assert_eq!(maildir.read_mail("mail-a").unwrap(), b"first");
        assert_eq!(maildir.list_cur().unwrap(), vec!["mail-a", "mail-b"]);

        maildir.remove_mail("mail-a").unwrap();
        assert_eq!(maildir.list_cur().unwrap(), vec!["mail-b"]);

        maildir.remove().unwrap();
        assert!(!maildir.exists());
    }
}
