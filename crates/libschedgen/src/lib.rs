pub mod classify;
pub mod debug_dump;
pub mod error;
pub mod interpreter;
pub mod session;
pub mod worker;

pub use classify::{KeywordClassifier, LineClass, LineClassifier, PROGRESS_KEYWORDS};
pub use error::{SessionError, WorkerError};
pub use interpreter::{Interpreter, default_candidates, find_python, resolve_python};
pub use session::{Orchestrator, SessionReport, SessionSettings};
pub use worker::{WorkerCommand, WorkerEvent, WorkerExit, WorkerHandle, WorkerInput};
