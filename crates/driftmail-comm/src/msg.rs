//! Update message and confirmation types exchanged between replicas.
//!
//! The payload mirrors the five replicated IMAP mutations. Remove sets
//! travel as explicit `(tag, value)` pairs so the downstream applier can
//! feed them straight into the OR-Set's remove effect.

use driftmail_crdt::VectorClock;
use driftmail_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Confirmation status for a successfully applied update.
pub const STATUS_OK: u32 = 0;

/// A single `(tag, value)` observation carried in an update message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    pub value: String,
}

impl Element {
    pub fn new(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
        }
    }
}

/// A mail observation together with the raw message bytes, shipped so a
/// replica that has never seen the mail can materialize the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub tag: String,
    pub value: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

/// Operation-specific payload of an update message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Operation {
    Create {
        user: String,
        mailbox: String,
        add_mailbox: Element,
    },
    Delete {
        user: String,
        mailbox: String,
        rmv_mailbox: Vec<Element>,
    },
    Append {
        user: String,
        mailbox: String,
        add_mail: Mail,
    },
    Expunge {
        user: String,
        mailbox: String,
        rmv_mail: Vec<Element>,
    },
    Store {
        user: String,
        mailbox: String,
        rmv_mail: Vec<Element>,
        add_mail: Mail,
    },
}

impl Operation {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Delete { .. } => "delete",
            Operation::Append { .. } => "append",
            Operation::Expunge { .. } => "expunge",
            Operation::Store { .. } => "store",
        }
    }
}

/// A stamped update message as it travels between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Originating replica name
    pub replica: String,
    /// Originator's full clock at send time
    pub vclock: VectorClock,
    #[serde(flatten)]
    pub operation: Operation,
}

impl UpdateMessage {
    /// The originator's own clock entry; orders messages from one sender.
    pub fn sender_seq(&self) -> u32 {
        self.vclock.get(&self.replica)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to encode update message: {}", e)))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("failed to decode update message: {}", e)))
    }
}

/// The receiver's reply frame: `0` acknowledges a fully applied update,
/// anything else is a retryable peer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub status: u32,
}

impl Confirmation {
    pub fn ok() -> Self {
        Self { status: STATUS_OK }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to encode confirmation: {}", e)))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("failed to decode confirmation: {}", e)))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
