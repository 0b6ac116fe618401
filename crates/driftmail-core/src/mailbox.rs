//! Worker-side (upstream) mailbox mutations.
//!
//! Each handler mutates local state under the caller-held write lock,
//! minting fresh tags and running the same effect path the downstream
//! applier uses, then returns the composed update message. The caller
//! hands that message to the sender once the lock is released, so the
//! update is emitted strictly after the local OR-Set log is durable.

use crate::applier;
use crate::maildir::Maildir;
use crate::node::NodeState;
use chrono::Utc;
use driftmail_comm::{Element, Mail, Operation};
use driftmail_common::types::mint_tag;
use driftmail_common::{Error, Result};
use uuid::Uuid;

/// Maildir info prefix separating the base name from flag characters.
const FLAG_SEPARATOR: &str = ":2,";

/// CREATE: materialize a new mailbox locally and compose the update.
pub fn create_mailbox(state: &mut NodeState, user: &str, mailbox: &str) -> Result<Operation> {
    state.ensure_user(user)?;

    if mailbox == "INBOX" || state.structure_set(user).is_some_and(|s| s.lookup(mailbox)) {
        return Err(Error::Protocol(format!("mailbox {} already exists", mailbox)));
    }

    let add = Element::new(mint_tag(), mailbox);
    applier::apply_create(state, user, mailbox, &add)?;

    Ok(Operation::Create {
        user: user.to_string(),
        mailbox: mailbox.to_string(),
        add_mailbox: add,
    })
}

/// DELETE: collect every observed tag of the mailbox name, remove them
/// locally and compose the update carrying exactly those tags.
pub fn delete_mailbox(state: &mut NodeState, user: &str, mailbox: &str) -> Result<Operation> {
    if mailbox == "INBOX" {
        return Err(Error::Protocol("INBOX cannot be deleted".to_string()));
    }

    let structure = state
        .structure_set(user)
        .ok_or_else(|| Error::Protocol(format!("no such mailbox {}", mailbox)))?;
    let observed = observed_tags(structure, mailbox)?;
    applier::apply_delete(state, user, mailbox, &observed)?;

    Ok(Operation::Delete {
        user: user.to_string(),
        mailbox: mailbox.to_string(),
        rmv_mailbox: observed,
    })
}

/// APPEND: store a new mail under a freshly minted Maildir name.
pub fn append_mail(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    contents: &[u8],
) -> Result<Operation> {
    state.ensure_user(user)?;
    require_mailbox(state, user, mailbox)?;

    let add = Mail {
        tag: mint_tag(),
        value: fresh_mail_name(),
        contents: contents.to_vec(),
    };
    applier::apply_append(state, user, mailbox, &add)?;

    Ok(Operation::Append {
        user: user.to_string(),
        mailbox: mailbox.to_string(),
        add_mail: add,
    })
}

/// EXPUNGE: remove the message at 1-based sequence number `seq`.
pub fn expunge_mail(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    seq: u32,
) -> Result<Operation> {
    require_mailbox(state, user, mailbox)?;
    let value = value_at(state, user, mailbox, seq)?;

    let set = state
        .mailbox_set(user, mailbox)
        .ok_or(Error::ElementNotFound)?;
    let observed = observed_tags(set, &value)?;
    applier::apply_expunge(state, user, mailbox, &observed)?;

    Ok(Operation::Expunge {
        user: user.to_string(),
        mailbox: mailbox.to_string(),
        rmv_mail: observed,
    })
}

/// STORE: rewrite the message's flag set by renaming it, CRDT-wise an
/// expunge of the old name plus an append of the flagged one. Returns
/// `None` when the flags already match and there is nothing to replicate.
pub fn store_mail(
    state: &mut NodeState,
    user: &str,
    mailbox: &str,
    seq: u32,
    flags: &[String],
) -> Result<Option<Operation>> {
    require_mailbox(state, user, mailbox)?;
    let old_value = value_at(state, user, mailbox, seq)?;

    let new_value = flagged_name(&old_value, flags)?;
    if new_value == old_value {
        return Ok(None);
    }

    let contents = Maildir::for_mailbox(&state.maildir_root, user, mailbox).read_mail(&old_value)?;
    let set = state
        .mailbox_set(user, mailbox)
        .ok_or(Error::ElementNotFound)?;
    let observed = observed_tags(set, &old_value)?;
    let add = Mail {
        tag: mint_tag(),
        value: new_value,
        contents,
    };
    applier::apply_store(state, user, mailbox, &observed, &add)?;

    Ok(Some(Operation::Store {
        user: user.to_string(),
        mailbox: mailbox.to_string(),
        rmv_mail: observed,
        add_mail: add,
    }))
}

fn require_mailbox(state: &NodeState, user: &str, mailbox: &str) -> Result<()> {
    let hosted = state
        .structure_set(user)
        .is_some_and(|s| s.lookup(mailbox));
    if hosted {
        Ok(())
    } else {
        Err(Error::Protocol(format!("no such mailbox {}", mailbox)))
    }
}

fn value_at(state: &NodeState, user: &str, mailbox: &str, seq: u32) -> Result<String> {
    state
        .contents
        .get(user)
        .and_then(|c| c.get(mailbox))
        .and_then(|sequence| {
            seq.checked_sub(1)
                .and_then(|index| sequence.get(index as usize))
        })
        .cloned()
        .ok_or_else(|| Error::Protocol(format!("no message with sequence number {}", seq)))
}

/// Every `(tag, value)` pair this replica has observed for `value`.
fn observed_tags(set: &driftmail_crdt::OrSet, value: &str) -> Result<Vec<Element>> {
    let observed: Vec<Element> = set
        .elements()
        .into_iter()
        .filter(|(_, v)| v == value)
        .map(|(tag, v)| Element::new(tag, v))
        .collect();

    if observed.is_empty() {
        return Err(Error::ElementNotFound);
    }
    Ok(observed)
}

/// Fresh Maildir-style unique name: timestamp, unique part, host tag.
fn fresh_mail_name() -> String {
    format!("{}.{}.driftmail", Utc::now().timestamp(), Uuid::new_v4())
}

/// Apply IMAP flags to a Maildir name: strip any existing info suffix,
/// then append the sorted flag characters.
fn flagged_name(value: &str, flags: &[String]) -> Result<String> {
    let base = value.split(FLAG_SEPARATOR).next().unwrap_or(value);
    if flags.is_empty() {
        return Ok(base.to_string());
    }

    let mut chars = Vec::with_capacity(flags.len());
    for flag in flags {
        let c = match flag.to_uppercase().as_str() {
            "\\SEEN" => 'S',
            "\\ANSWERED" => 'R',
            "\\FLAGGED" => 'F',
            "\\DELETED" => 'T',
            "\\DRAFT" => 'D',
            other => {
                return Err(Error::Protocol(format!("unsupported flag {}", other)));
            }
        };
        chars.push(c);
    }
    chars.sort_unstable();
    chars.dedup();

    Ok(format!(
        "{}{}{}",
        base,
        FLAG_SEPARATOR,
        chars.into_iter().collect::<String>()
    ))
}
