//! Error types for driftmail

use thiserror::Error;

/// Main error type for driftmail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A CRDT log file held an odd number of `;`-separated tokens.
    #[error("odd number of elements in CRDT file '{path}'")]
    OddElementCount { path: String },

    /// A value token in a CRDT log file was not valid base64. The inner
    /// rendering names the offending byte offset.
    #[error("decoding base64 string in CRDT file '{path}' failed: {inner}")]
    CrdtDecode { path: String, inner: String },

    /// `remove` was invoked for a value no tag currently maps to.
    #[error("element to be removed not found in set")]
    ElementNotFound,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for driftmail
pub type Result<T> = std::result::Result<T, Error>;
