//! Per-replica node state.
//!
//! One owned struct holds every user's mailbox structure OR-Sets, the
//! sequence-number contents maps and the storage roots. All mutation goes
//! through the embedded reader-writer lock: the applier and mutating IMAP
//! handlers take the write side, read-only handlers the read side. There
//! are no ambient globals; tasks receive a handle on this struct.

use crate::maildir::Maildir;
use driftmail_common::{Error, Result};
use driftmail_crdt::OrSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Key of the distinguished OR-Set listing a user's mailbox names.
pub const STRUCTURE_KEY: &str = "Structure";

const STRUCTURE_LOG: &str = "structure.log";

/// Everything the node lock guards.
#[derive(Debug)]
pub struct NodeState {
    pub maildir_root: PathBuf,
    pub crdt_root: PathBuf,
    /// user → (mailbox name or `STRUCTURE_KEY`) → OR-Set
    pub structure: HashMap<String, HashMap<String, OrSet>>,
    /// user → mailbox → mail values in IMAP sequence-number order
    pub contents: HashMap<String, HashMap<String, Vec<String>>>,
}

impl NodeState {
    /// Open the node's on-disk state, recovering every user found under
    /// the CRDT layer root by reloading its OR-Set logs.
    pub fn open(maildir_root: impl Into<PathBuf>, crdt_root: impl Into<PathBuf>) -> Result<Self> {
        let maildir_root = maildir_root.into();
        let crdt_root = crdt_root.into();

        for root in [&maildir_root, &crdt_root] {
            std::fs::create_dir_all(root)
                .map_err(|e| Error::Storage(format!("failed to create storage root: {}", e)))?;
        }

        let mut state = Self {
            maildir_root,
            crdt_root: crdt_root.clone(),
            structure: HashMap::new(),
            contents: HashMap::new(),
        };

        let entries = std::fs::read_dir(&crdt_root)
            .map_err(|e| Error::Storage(format!("failed to scan CRDT layer root: {}", e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::Storage(format!("failed to scan CRDT layer root: {}", e)))?;
            if entry
                .file_type()
                .map_err(|e| Error::Storage(format!("failed to scan CRDT layer root: {}", e)))?
                .is_dir()
            {
                let user = entry.file_name().to_string_lossy().into_owned();
                state.load_user(&user)?;
            }
        }

        Ok(state)
    }

    /// Reload one user's OR-Set logs and rebuild the contents sequences
    /// from the Maildir, lexicographically, filtered to values the
    /// mailbox OR-Set still observes.
    fn load_user(&mut self, user: &str) -> Result<()> {
        let structure = OrSet::open(self.structure_log_path(user))?;

        let mut sets = HashMap::new();
        let mut contents = HashMap::new();
        for mailbox in structure.values() {
            let set = OrSet::open(self.crdt_log_path(user, &mailbox))?;
            let maildir = Maildir::for_mailbox(&self.maildir_root, user, &mailbox);
            let sequence = if maildir.exists() {
                maildir
                    .list_cur()?
                    .into_iter()
                    .filter(|value| set.lookup(value))
                    .collect()
            } else {
                Vec::new()
            };
            sets.insert(mailbox.clone(), set);
            contents.insert(mailbox, sequence);
        }

        info!(user = %user, mailboxes = sets.len(), "recovered user state");
        sets.insert(STRUCTURE_KEY.to_string(), structure);
        self.structure.insert(user.to_string(), sets);
        self.contents.insert(user.to_string(), contents);
        Ok(())
    }

    /// Make sure `user` exists with an INBOX; a no-op for known users.
    pub fn ensure_user(&mut self, user: &str) -> Result<()> {
        if self.structure.contains_key(user) {
            return Ok(());
        }

        std::fs::create_dir_all(self.crdt_root.join(user))
            .map_err(|e| Error::Storage(format!("failed to create user CRDT dir: {}", e)))?;

        let inbox_maildir = Maildir::for_mailbox(&self.maildir_root, user, "INBOX");
        if !inbox_maildir.exists() {
            inbox_maildir.create()?;
        }

        let structure = OrSet::open(self.structure_log_path(user))?;
        if !structure.lookup("INBOX") {
            structure.add("INBOX")?;
        }
        let inbox = OrSet::open(self.crdt_log_path(user, "INBOX"))?;
        let sequence = inbox_maildir
            .list_cur()?
            .into_iter()
            .filter(|value| inbox.lookup(value))
            .collect();

        let mut sets = HashMap::new();
        sets.insert("INBOX".to_string(), inbox);
        sets.insert(STRUCTURE_KEY.to_string(), structure);
        self.structure.insert(user.to_string(), sets);

        let mut contents = HashMap::new();
        contents.insert("INBOX".to_string(), sequence);
        self.contents.insert(user.to_string(), contents);

        info!(user = %user, "provisioned user state");
        Ok(())
    }

    /// The user's mailbox-name OR-Set.
    pub fn structure_set(&self, user: &str) -> Option<&OrSet> {
        self.structure.get(user)?.get(STRUCTURE_KEY)
    }

    /// The OR-Set of one mailbox.
    pub fn mailbox_set(&self, user: &str, mailbox: &str) -> Option<&OrSet> {
        self.structure.get(user)?.get(mailbox)
    }

    pub fn structure_log_path(&self, user: &str) -> PathBuf {
        self.crdt_root.join(user).join(STRUCTURE_LOG)
    }

    pub fn crdt_log_path(&self, user: &str, mailbox: &str) -> PathBuf {
        self.crdt_root.join(user).join(format!("{}.log", mailbox))
    }
}

/// The node state behind its exclusive lock.
#[derive(Debug)]
pub struct Node {
    pub state: RwLock<NodeState>,
}

impl Node {
    pub fn open(
        maildir_root: impl Into<PathBuf>,
        crdt_root: impl Into<PathBuf>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            state: RwLock::new(NodeState::open(maildir_root, crdt_root)?),
        }))
    }
}
