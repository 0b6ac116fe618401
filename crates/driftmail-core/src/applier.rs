//! The downstream mutator.
//!
//! Executes delivered update messages against local files and in-memory
//! mailbox state, always under the node's write lock. Handlers are
//! idempotent with respect to the CRDT (tags are keys, so re-delivery
//! reproduces the same final state) and transactional: CREATE remembers
//! every object it created and reverts them in reverse order on failure.
//! An I/O failure past the point of no return is fatal for the process;
//! the applier never leaves memory ahead of disk.

use crate::maildir::Maildir;
use crate::node::{Node, NodeState, STRUCTURE_KEY};
use driftmail_comm::{ApplyRequest, Element, Mail, Operation, UpdateMessage};
use driftmail_common::{Error, Result};
use driftmail_crdt::OrSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Execute one delivered update against the node state.
pub fn apply(state: &mut NodeState, msg: &UpdateMessage) -> Result<()> {
    match &msg.operation {
        Operation::Create {
            user,
            mailbox,
            add_mailbox,
        } => apply_create(state, user, mailbox, add_mailbox),
        Operation::Delete {
            user,
            mailbox,
            rmv_mailbox,
        } => apply_delete(state, user, mailbox, rmv_mailbox),
        Operation::Append {
            user,
            mailbox,
            add_mail,
        } => apply_append(state, user, mailbox, add_mail),
        Operation::Expunge {
            user,
            mailbox,
            rmv_mail,
        } => apply_expunge(state, user, mailbox, rmv_mail),
        Operation::Store {
            user,
            mailbox,
            rmv_mail,
            add_mail,
        } => apply_store(state, user, mailbox, rmv_mail, add_mail),
    }
}

/// Downstream CREATE: materialize the mailbox, then add the observation
/// to the user's structure OR-Set. Every object this call created is
/// reverted, in reverse order, when a later step fails.
pub fn apply_create(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    add: &Element,
) -> Result<()> {
    state.ensure_user(user)?;

    let maildir = Maildir::for_mailbox(&state.maildir_root, user, mailbox);
    let log_path = state.crdt_log_path(user, mailbox);

    let mut created_maildir = false;
    let mut created_log = false;
    let mut created_structure_entry = false;
    let mut created_contents_entry = false;

    if !maildir.exists() {
        maildir.create()?;
        created_maildir = true;
    }

    let mut opened_set = None;
    if !log_path.exists() {
        match OrSet::open(&log_path) {
            Ok(set) => {
                created_log = true;
                opened_set = Some(set);
            }
            Err(e) => {
                warn!(user = %user, mailbox = %mailbox, error = %e,
                      "downstream CREATE failed, reverting");
                if created_maildir {
                    let _ = maildir.remove();
                }
                return Err(e);
            }
        }
    }

    let user_sets = state
        .structure
        .get_mut(user)
        .expect("ensure_user populated the structure map");
    if !user_sets.contains_key(mailbox) {
        let set = match opened_set {
            Some(set) => set,
            None => match OrSet::from_file(&log_path) {
                Ok(set) => set,
                Err(e) => {
                    warn!(user = %user, mailbox = %mailbox, error = %e,
                          "downstream CREATE failed, reverting");
                    if created_log {
                        let _ = std::fs::remove_file(&log_path);
                    }
                    if created_maildir {
                        let _ = maildir.remove();
                    }
                    return Err(e);
                }
            },
        };
        user_sets.insert(mailbox.to_string(), set);
        created_structure_entry = true;
    }

    let user_contents = state
        .contents
        .get_mut(user)
        .expect("ensure_user populated the contents map");
    if !user_contents.contains_key(mailbox) {
        user_contents.insert(mailbox.to_string(), Vec::new());
        created_contents_entry = true;
    }

    let added = state
        .structure
        .get(user)
        .and_then(|sets| sets.get(STRUCTURE_KEY))
        .expect("ensure_user populated the structure OR-Set")
        .add_effect(&add.value, &add.tag, true);

    if let Err(e) = added {
        warn!(user = %user, mailbox = %mailbox, error = %e,
              "downstream CREATE failed, reverting");
        if created_contents_entry {
            if let Some(contents) = state.contents.get_mut(user) {
                contents.remove(mailbox);
            }
        }
        if created_structure_entry {
            if let Some(sets) = state.structure.get_mut(user) {
                sets.remove(mailbox);
            }
        }
        if created_log {
            let _ = std::fs::remove_file(&log_path);
        }
        if created_maildir {
            let _ = maildir.remove();
        }
        return Err(e);
    }
    Ok(())
}

/// Downstream DELETE: remove the observed tags; tear the mailbox down
/// only when no tag survives (a concurrent CREATE that raced the delete
/// keeps files, logs and contents in place).
pub fn apply_delete(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    rmv: &[Element],
) -> Result<()> {
    let pairs = as_pairs(rmv);

    let survived = {
        let Some(structure) = state.structure_set(user) else {
            debug!(user = %user, mailbox = %mailbox, "dropping delete for unknown user");
            return Ok(());
        };
        structure.remove_effect(&pairs, true)?;
        structure.lookup(mailbox)
    };

    if survived {
        debug!(user = %user, mailbox = %mailbox,
               "concurrent create keeps mailbox alive; leaving files in place");
        return Ok(());
    }

    if let Some(sets) = state.structure.get_mut(user) {
        sets.remove(mailbox);
    }
    if let Some(contents) = state.contents.get_mut(user) {
        contents.remove(mailbox);
    }

    let log_path = state.crdt_log_path(user, mailbox);
    if log_path.exists() {
        std::fs::remove_file(&log_path)
            .map_err(|e| Error::Storage(format!("failed to remove CRDT file: {}", e)))?;
    }

    let maildir = Maildir::for_mailbox(&state.maildir_root, user, mailbox);
    if maildir.exists() {
        maildir.remove()?;
    }
    Ok(())
}

/// Downstream APPEND: materialize the mail file only when this replica
/// has never observed the value; otherwise only the new tag lands. A
/// mailbox this replica no longer hosts drops the update silently.
pub fn apply_append(state: &mut NodeState, user: &str, mailbox: &str, add: &Mail) -> Result<()> {
    let hosted = state
        .structure_set(user)
        .map(|s| s.lookup(mailbox))
        .unwrap_or(false);
    if !hosted {
        debug!(user = %user, mailbox = %mailbox, "mailbox no longer hosted; dropping append");
        return Ok(());
    }

    let maildir = Maildir::for_mailbox(&state.maildir_root, user, mailbox);
    let materialized = {
        let set = state
            .mailbox_set(user, mailbox)
            .ok_or_else(|| Error::Internal(format!("mailbox OR-Set missing for {}", mailbox)))?;

        if set.lookup(&add.value) {
            set.add_effect(&add.value, &add.tag, true)?;
            false
        } else {
            maildir.deliver(&add.value, &add.contents)?;
            if let Err(e) = set.add_effect(&add.value, &add.tag, true) {
                warn!(user = %user, mailbox = %mailbox, error = %e,
                      "downstream APPEND failed, reverting");
                let _ = maildir.remove_mail(&add.value);
                return Err(e);
            }
            true
        }
    };

    if materialized {
        if let Some(sequence) = state
            .contents
            .get_mut(user)
            .and_then(|c| c.get_mut(mailbox))
        {
            sequence.push(add.value.clone());
        }
    }
    Ok(())
}

/// Downstream EXPUNGE: drop the observed tags, delete the file once the
/// last tag is gone, and shift the sequence down past the first
/// occurrence of the value.
pub fn apply_expunge(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    rmv: &[Element],
) -> Result<()> {
    let Some(value) = rmv.first().map(|e| e.value.clone()) else {
        return Ok(());
    };

    let hosted = state
        .structure_set(user)
        .map(|s| s.lookup(mailbox))
        .unwrap_or(false);
    if !hosted {
        debug!(user = %user, mailbox = %mailbox, "mailbox no longer hosted; dropping expunge");
        return Ok(());
    }

    let gone = {
        let set = state
            .mailbox_set(user, mailbox)
            .ok_or_else(|| Error::Internal(format!("mailbox OR-Set missing for {}", mailbox)))?;
        set.remove_effect(&as_pairs(rmv), true)?;
        !set.lookup(&value)
    };

    if gone {
        Maildir::for_mailbox(&state.maildir_root, user, mailbox).remove_mail(&value)?;
    }

    if let Some(sequence) = state
        .contents
        .get_mut(user)
        .and_then(|c| c.get_mut(mailbox))
    {
        if let Some(pos) = sequence.iter().position(|v| v == &value) {
            sequence.remove(pos);
        }
    }
    Ok(())
}

/// Downstream STORE: expunge the old value, materialize the new one, and
/// replace the sequence entry in place. When the new value already sat at
/// another index, the existing occurrence stays and the old entry is
/// dropped without insertion.
pub fn apply_store(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    rmv: &[Element],
    add: &Mail,
) -> Result<()> {
    let Some(old_value) = rmv.first().map(|e| e.value.clone()) else {
        return Ok(());
    };

    let hosted = state
        .structure_set(user)
        .map(|s| s.lookup(mailbox))
        .unwrap_or(false);
    if !hosted {
        debug!(user = %user, mailbox = %mailbox, "mailbox no longer hosted; dropping store");
        return Ok(());
    }

    let maildir = Maildir::for_mailbox(&state.maildir_root, user, mailbox);
    {
        let set = state
            .mailbox_set(user, mailbox)
            .ok_or_else(|| Error::Internal(format!("mailbox OR-Set missing for {}", mailbox)))?;

        set.remove_effect(&as_pairs(rmv), true)?;
        if !set.lookup(&old_value) {
            maildir.remove_mail(&old_value)?;
        }

        if set.lookup(&add.value) {
            set.add_effect(&add.value, &add.tag, true)?;
        } else {
            maildir.deliver(&add.value, &add.contents)?;
            if let Err(e) = set.add_effect(&add.value, &add.tag, true) {
                warn!(user = %user, mailbox = %mailbox, error = %e,
                      "downstream STORE failed, reverting");
                let _ = maildir.remove_mail(&add.value);
                return Err(e);
            }
        }
    }

    if let Some(sequence) = state
        .contents
        .get_mut(user)
        .and_then(|c| c.get_mut(mailbox))
    {
        if let Some(pos) = sequence.iter().position(|v| v == &old_value) {
            let duplicate = sequence
                .iter()
                .enumerate()
                .any(|(i, v)| i != pos && v == &add.value);
            if duplicate {
                sequence.remove(pos);
            } else {
                sequence[pos] = add.value.clone();
            }
        }
    }
    Ok(())
}

fn as_pairs(elements: &[Element]) -> Vec<(String, String)> {
    elements
        .iter()
        .map(|e| (e.tag.clone(), e.value.clone()))
        .collect()
}

/// Consume delivered updates off the receiver channel, each applied under
/// the node's write lock. A failed apply terminates the process: dropping
/// a delivered message would violate causal delivery, and the revert
/// already restored whatever could be restored for recovery to reload.
pub async fn run(node: Arc<Node>, mut apply_rx: mpsc::Receiver<ApplyRequest>) {
    while let Some(req) = apply_rx.recv().await {
        let outcome = {
            let mut state = node.state.write().await;
            apply(&mut state, &req.msg)
        };
        match outcome {
            Ok(()) => {
                let _ = req.done.send(());
            }
            Err(e) => {
                error!(
                    replica = %req.msg.replica,
                    op = req.msg.operation.name(),
                    error = %e,
                    "downstream apply failed; terminating to avoid memory/disk divergence"
                );
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: NodeState,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut state =
            NodeState::open(dir.path().join("maildir"), dir.path().join("crdt")).unwrap();
        state.ensure_user("alice").unwrap();
        Fixture { _dir: dir, state }
    }

    fn mail(tag: &str, value: &str, contents: &[u8]) -> Mail {
        Mail {
            tag: tag.to_string(),
            value: value.to_string(),
            contents: contents.to_vec(),
        }
    }

    #[test]
    fn test_create_materializes_mailbox() {
        let mut fx = fixture();
        apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-1", "Drafts"),
        )
        .unwrap();

        assert!(fx.state.structure_set("alice").unwrap().lookup("Drafts"));
        assert!(fx.state.mailbox_set("alice", "Drafts").unwrap().is_empty());
        assert!(fx.state.contents["alice"]["Drafts"].is_empty());
        assert!(fx.state.crdt_log_path("alice", "Drafts").exists());
        assert!(Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts").exists());
    }

    #[test]
    fn test_create_redelivery_is_a_noop() {
        let mut fx = fixture();
        let add = Element::new("t-1", "Drafts");
        apply_create(&mut fx.state, "alice", "Drafts", &add).unwrap();
        let before = fx.state.structure_set("alice").unwrap().elements();

        apply_create(&mut fx.state, "alice", "Drafts", &add).unwrap();
        assert_eq!(fx.state.structure_set("alice").unwrap().elements(), before);
    }

    #[test]
    fn test_create_rolls_back_everything_it_created() {
        let mut fx = fixture();

        // Sabotage the structure log so the final add effect fails.
        let structure_log = fx.state.structure_log_path("alice");
        std::fs::remove_file(&structure_log).unwrap();
        std::fs::create_dir(&structure_log).unwrap();

        let err = apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-1", "Drafts"),
        );
        assert!(err.is_err());

        // Everything this call created is gone again.
        assert!(!Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts").exists());
        assert!(!fx.state.crdt_log_path("alice", "Drafts").exists());
        assert!(!fx.state.structure["alice"].contains_key("Drafts"));
        assert!(!fx.state.contents["alice"].contains_key("Drafts"));

        // Pre-existing state was not touched.
        assert!(fx.state.structure_set("alice").unwrap().lookup("INBOX"));
        assert!(Maildir::for_mailbox(&fx.state.maildir_root, "alice", "INBOX").exists());
    }

    #[test]
    fn test_create_rollback_spares_preexisting_maildir() {
        let mut fx = fixture();

        // The Maildir already exists; only the log and map entries are new.
        Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts")
            .create()
            .unwrap();

        let structure_log = fx.state.structure_log_path("alice");
        std::fs::remove_file(&structure_log).unwrap();
        std::fs::create_dir(&structure_log).unwrap();

        apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-1", "Drafts"),
        )
        .unwrap_err();

        assert!(Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts").exists());
        assert!(!fx.state.crdt_log_path("alice", "Drafts").exists());
    }

    #[test]
    fn test_delete_removes_everything_when_no_tag_survives() {
        let mut fx = fixture();
        apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-1", "Drafts"),
        )
        .unwrap();

        apply_delete(
            &mut fx.state,
            "alice",
            "Drafts",
            &[Element::new("t-1", "Drafts")],
        )
        .unwrap();

        assert!(!fx.state.structure_set("alice").unwrap().lookup("Drafts"));
        assert!(!fx.state.structure["alice"].contains_key("Drafts"));
        assert!(!fx.state.contents["alice"].contains_key("Drafts"));
        assert!(!fx.state.crdt_log_path("alice", "Drafts").exists());
        assert!(!Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts").exists());
    }

    #[test]
    fn test_delete_leaves_files_when_concurrent_create_won() {
        let mut fx = fixture();
        apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-1", "Drafts"),
        )
        .unwrap();
        // A concurrent create on another replica added a second tag the
        // deleter never observed.
        apply_create(
            &mut fx.state,
            "alice",
            "Drafts",
            &Element::new("t-2", "Drafts"),
        )
        .unwrap();

        apply_delete(
            &mut fx.state,
            "alice",
            "Drafts",
            &[Element::new("t-1", "Drafts")],
        )
        .unwrap();

        assert!(fx.state.structure_set("alice").unwrap().lookup("Drafts"));
        assert!(fx.state.structure["alice"].contains_key("Drafts"));
        assert!(fx.state.contents["alice"].contains_key("Drafts"));
        assert!(fx.state.crdt_log_path("alice", "Drafts").exists());
        assert!(Maildir::for_mailbox(&fx.state.maildir_root, "alice", "Drafts").exists());
    }

    #[test]
    fn test_append_materializes_once() {
        let mut fx = fixture();
        let add = mail("t-1", "mail-1", b"hello");

        apply_append(&mut fx.state, "alice", "INBOX", &add).unwrap();

        let maildir = Maildir::for_mailbox(&fx.state.maildir_root, "alice", "INBOX");
        assert_eq!(maildir.read_mail("mail-1").unwrap(), b"hello");
        assert!(fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1"));
        assert_eq!(fx.state.contents["alice"]["INBOX"], vec!["mail-1"]);

        // Re-delivery (and a concurrent add under a new tag) only lands
        // tags; file and sequence stay untouched.
        apply_append(&mut fx.state, "alice", "INBOX", &add).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-2", "mail-1", b"hello")).unwrap();
        assert_eq!(fx.state.contents["alice"]["INBOX"], vec!["mail-1"]);
        assert_eq!(fx.state.mailbox_set("alice", "INBOX").unwrap().len(), 2);
    }

    #[test]
    fn test_append_to_unhosted_mailbox_is_dropped() {
        let mut fx = fixture();
        apply_append(
            &mut fx.state,
            "alice",
            "Gone",
            &mail("t-1", "mail-1", b"hello"),
        )
        .unwrap();
        assert!(!fx.state.contents["alice"].contains_key("Gone"));
    }

    #[test]
    fn test_expunge_deletes_file_only_with_last_tag() {
        let mut fx = fixture();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-1", "mail-1", b"hello")).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-2", "mail-1", b"hello")).unwrap();

        let maildir = Maildir::for_mailbox(&fx.state.maildir_root, "alice", "INBOX");

        // Only one of two tags observed: the file survives.
        apply_expunge(
            &mut fx.state,
            "alice",
            "INBOX",
            &[Element::new("t-1", "mail-1")],
        )
        .unwrap();
        assert!(maildir.mail_path("mail-1").exists());
        assert!(fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1"));
        assert!(fx.state.contents["alice"]["INBOX"].is_empty());

        // The last tag takes the file with it.
        apply_expunge(
            &mut fx.state,
            "alice",
            "INBOX",
            &[Element::new("t-2", "mail-1")],
        )
        .unwrap();
        assert!(!maildir.mail_path("mail-1").exists());
        assert!(!fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1"));
    }

    #[test]
    fn test_expunge_shifts_sequence_numbers_down() {
        let mut fx = fixture();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-1", "mail-1", b"a")).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-2", "mail-2", b"b")).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-3", "mail-3", b"c")).unwrap();

        apply_expunge(
            &mut fx.state,
            "alice",
            "INBOX",
            &[Element::new("t-2", "mail-2")],
        )
        .unwrap();

        assert_eq!(fx.state.contents["alice"]["INBOX"], vec!["mail-1", "mail-3"]);
    }

    #[test]
    fn test_store_replaces_sequence_entry_in_place() {
        let mut fx = fixture();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-1", "mail-1", b"a")).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-2", "mail-2", b"b")).unwrap();

        apply_store(
            &mut fx.state,
            "alice",
            "INBOX",
            &[Element::new("t-1", "mail-1")],
            &mail("t-3", "mail-1:2,S", b"a"),
        )
        .unwrap();

        let maildir = Maildir::for_mailbox(&fx.state.maildir_root, "alice", "INBOX");
        assert!(!maildir.mail_path("mail-1").exists());
        assert_eq!(maildir.read_mail("mail-1:2,S").unwrap(), b"a");
        assert_eq!(
            fx.state.contents["alice"]["INBOX"],
            vec!["mail-1:2,S", "mail-2"]
        );
        assert!(!fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1"));
        assert!(fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1:2,S"));
    }

    /// After every update has been applied everywhere, both replicas hold
    /// identical element sets and sequences.
    #[test]
    fn test_replicas_converge_after_exchange() {
        let mut a = fixture();
        let mut b = fixture();

        // A creates a mailbox and appends into it; B applies both.
        let create = crate::mailbox::create_mailbox(&mut a.state, "alice", "Shared").unwrap();
        let Operation::Create { add_mailbox, .. } = &create else {
            panic!("expected a create operation");
        };
        apply_create(&mut b.state, "alice", "Shared", add_mailbox).unwrap();

        let append = crate::mailbox::append_mail(&mut a.state, "alice", "Shared", b"m").unwrap();
        let Operation::Append { add_mail, .. } = &append else {
            panic!("expected an append operation");
        };
        apply_append(&mut b.state, "alice", "Shared", add_mail).unwrap();

        // B expunges the mail; A applies the removal.
        let expunge = crate::mailbox::expunge_mail(&mut b.state, "alice", "Shared", 1).unwrap();
        let Operation::Expunge { rmv_mail, .. } = &expunge else {
            panic!("expected an expunge operation");
        };
        apply_expunge(&mut a.state, "alice", "Shared", rmv_mail).unwrap();

        assert_eq!(
            a.state.mailbox_set("alice", "Shared").unwrap().elements(),
            b.state.mailbox_set("alice", "Shared").unwrap().elements()
        );
        assert_eq!(
            a.state.contents["alice"]["Shared"],
            b.state.contents["alice"]["Shared"]
        );
        assert_eq!(
            a.state.structure_set("alice").unwrap().elements(),
            b.state.structure_set("alice").unwrap().elements()
        );
    }

    /// Observed-remove: a removal only covers the tags its issuer saw, so
    /// a concurrent add on another replica survives the exchange.
    #[test]
    fn test_concurrent_add_survives_remove() {
        let mut a = fixture();
        let mut b = fixture();

        // Both replicas observe the mailbox under t-1.
        let t1 = Element::new("t-1", "Box");
        apply_create(&mut a.state, "alice", "Box", &t1).unwrap();
        apply_create(&mut b.state, "alice", "Box", &t1).unwrap();

        // Concurrently: B deletes (observing only t-1) while a third
        // replica's create adds t-2, which A applies first.
        let t2 = Element::new("t-2", "Box");
        apply_create(&mut a.state, "alice", "Box", &t2).unwrap();
        apply_delete(&mut b.state, "alice", "Box", &[t1.clone()]).unwrap();

        // Exchange both updates.
        apply_delete(&mut a.state, "alice", "Box", &[t1]).unwrap();
        apply_create(&mut b.state, "alice", "Box", &t2).unwrap();

        // The mailbox survives everywhere, via t-2 alone.
        for fx in [&a, &b] {
            assert!(fx.state.structure_set("alice").unwrap().lookup("Box"));
            let tags: Vec<String> = fx
                .state
                .structure_set("alice")
                .unwrap()
                .elements()
                .into_iter()
                .filter(|(_, v)| v == "Box")
                .map(|(t, _)| t)
                .collect();
            assert_eq!(tags, vec!["t-2".to_string()]);
        }
        assert_eq!(
            a.state.structure_set("alice").unwrap().elements(),
            b.state.structure_set("alice").unwrap().elements()
        );
    }

    #[test]
    fn test_store_drops_old_entry_when_new_value_already_present() {
        let mut fx = fixture();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-1", "mail-1", b"a")).unwrap();
        apply_append(&mut fx.state, "alice", "INBOX", &mail("t-2", "mail-2", b"b")).unwrap();

        // The new value already sits at another index: the existing
        // occurrence stays, the old entry vanishes without insertion.
        apply_store(
            &mut fx.state,
            "alice",
            "INBOX",
            &[Element::new("t-1", "mail-1")],
            &mail("t-3", "mail-2", b"b"),
        )
        .unwrap();

        assert_eq!(fx.state.contents["alice"]["INBOX"], vec!["mail-2"]);
        assert!(!fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-1"));
        assert!(fx.state.mailbox_set("alice", "INBOX").unwrap().lookup("mail-2"));
    }
}
