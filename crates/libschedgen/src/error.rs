use std::time::Duration;

use schedgen_protocol::{ErrorKind, RAW_PREVIEW_CHARS, StreamLine};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one scheduling session.
///
/// Each variant renders to exactly the line the caller sees; see
/// [`SessionError::to_line`].
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No JSON data received.")]
    EmptyBody,

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Failed to start Python: {0}")]
    Spawn(String),

    #[error("Python process exited with code {0}")]
    NonZeroExit(i32),

    #[error("Python process terminated by signal {0}")]
    Signalled(i32),

    #[error("Failed to wait for Python process: {0}")]
    Reap(String),

    #[error("No output received from Python")]
    NoOutput,

    #[error("Decryption or parsing failed")]
    Decrypt { details: String, raw: String },

    #[error("Python process timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::EmptyBody | SessionError::InvalidJson(_) => ErrorKind::InvalidInput,
            SessionError::Encryption(_) => ErrorKind::EncryptionFailure,
            SessionError::Spawn(_) => ErrorKind::SpawnFailure,
            SessionError::NonZeroExit(_) | SessionError::Signalled(_) | SessionError::Reap(_) => {
                ErrorKind::WorkerNonZeroExit
            }
            SessionError::NoOutput => ErrorKind::NoOutput,
            SessionError::Decrypt { .. } => ErrorKind::DecryptFailure,
            SessionError::Timeout(_) => ErrorKind::WorkerTimeout,
            SessionError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Build a decrypt failure carrying a bounded prefix of the raw buffer.
    pub fn decrypt(details: impl Into<String>, buffer: &str) -> Self {
        let prefix: String = buffer.chars().take(RAW_PREVIEW_CHARS).collect();
        SessionError::Decrypt {
            details: details.into(),
            raw: format!("{prefix}..."),
        }
    }

    /// The terminal line sent to the caller. `None` once the caller is gone.
    pub fn to_line(&self) -> Option<StreamLine> {
        match self {
            SessionError::Cancelled => None,
            SessionError::NonZeroExit(_) | SessionError::Signalled(_) => {
                Some(StreamLine::Error(self.to_string()))
            }
            SessionError::Decrypt { details, raw } => Some(StreamLine::Document(json!({
                "error": self.to_string(),
                "details": details,
                "raw": raw,
            }))),
            _ => Some(StreamLine::failure(self.to_string())),
        }
    }
}
