use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Route that runs one scheduling session and streams its output.
pub const SCHEDULE_ROUTE: &str = "/generate-schedule";
/// Liveness route.
pub const HEALTH_ROUTE: &str = "/";
pub const HEALTH_MESSAGE: &str = "Schedule Generator API is running\n";

/// Upper bound on an accepted request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;
/// Characters of undecryptable worker output echoed back for debugging.
pub const RAW_PREVIEW_CHARS: usize = 500;
/// Oversized field the worker keeps for local debugging; never returned.
pub const DEBUG_FIELD: &str = "all_schedule";

pub const PROGRESS_PREFIX: &str = "[PROGRESS]";
pub const ERROR_PREFIX: &str = "[ERROR]";

/// One line of the streamed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// Worker narration, forwarded as soon as it is read.
    Progress(String),
    /// Worker stderr output or a non-zero exit notice.
    Error(String),
    /// Terminal JSON document: the result, or an object with an `error` field.
    Document(Value),
}

impl StreamLine {
    pub fn failure(message: impl Into<String>) -> Self {
        StreamLine::Document(json!({ "error": message.into() }))
    }

    /// Render as a single newline-terminated line.
    pub fn render(&self) -> String {
        match self {
            StreamLine::Progress(text) => format!("{PROGRESS_PREFIX} {text}\n"),
            StreamLine::Error(text) => format!("{ERROR_PREFIX} {text}\n"),
            StreamLine::Document(value) => format!("{value}\n"),
        }
    }
}

/// Why a session ended without a result.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    EncryptionFailure,
    SpawnFailure,
    WorkerNonZeroExit,
    NoOutput,
    DecryptFailure,
    WorkerTimeout,
    Cancelled,
}

/// Lifecycle of one request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum SessionState {
    Received,
    Validated,
    Encrypted,
    WorkerRunning,
    Completed,
    Failed(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}
