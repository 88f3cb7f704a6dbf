//! Error types for the ingestion pipeline.
//!
//! The pipeline distinguishes recoverable, local failures (a line that is not
//! JSON, a record that cannot be turned into a statement) from failures that
//! must stop the process (the store stays unreachable past the retry budget,
//! or answers in a way the queue cannot classify).
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | [`DecodeError`] | one log line | logged, line skipped |
//! | [`ConversionError`] | one record | logged, record skipped |
//! | [`PublishError::Connection`] / [`PublishError::Auth`] | one publish attempt | retried up to `publish.max_retries` |
//! | [`PublishError::Storage`] | one statement | statement dropped, rest retried |
//! | [`BridgeError`] | process | fatal |

use std::path::PathBuf;

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// A log line that could not be decoded into a [`RawRecord`](crate::models::RawRecord).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not valid UTF-8")]
    Utf8,

    #[error("record has no string `event_type` field")]
    MissingEventType,
}

/// A record that maps to a known statement kind but cannot be built into a
/// well-formed statement.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{event_type}: missing field `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },

    #[error("{event_type}: invalid field `{field}`: {reason}")]
    InvalidField {
        event_type: String,
        field: &'static str,
        reason: String,
    },

    #[error("{event_type}: constructed statement is incomplete: {reason}")]
    Incomplete { event_type: String, reason: String },
}

/// Outcome classes of a single publish call against the record store.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Transport failure or a transient server answer (timeouts, 5xx, 429).
    #[error("LRS connection failed: {0}")]
    Connection(String),

    /// The store refused our credentials.
    #[error("LRS rejected credentials ({status}): {message}")]
    Auth { status: u16, message: String },

    /// The store accepted the connection but refused one statement.
    #[error("LRS rejected statement {statement_id}: {message}")]
    Storage { statement_id: Uuid, message: String },

    /// Any answer that fits none of the classes above.
    #[error("unexpected LRS response ({status}): {message}")]
    Unexpected { status: u16, message: String },
}

impl PublishError {
    /// Connection-class errors are the only ones retried as-is.
    pub fn is_connection_class(&self) -> bool {
        matches!(self, PublishError::Connection(_) | PublishError::Auth { .. })
    }
}

/// Fatal errors that end a watch session and the process.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("giving up after {attempts} publish attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: PublishError,
    },

    #[error("LRS rejected statement {statement_id} which is not part of the submitted batch")]
    UnknownRejection { statement_id: Uuid },

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("publish queue halted after fatal error: {0}")]
    QueueHalted(String),
}

impl BridgeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source,
        }
    }
}
