//! One request's path from raw body to final line.
//!
//! ```text
//! Received -> Validated -> Encrypted -> WorkerRunning -> Completed
//!     \            \            \              \
//!      +------------+------------+--------------+--> Failed(kind)
//! ```
//!
//! The orchestrator is the only writer to the caller's sink. Worker stdout and
//! stderr arrive on one event source and are handled in arrival order on the
//! session's task, so the result buffer needs no locking and caller lines
//! never interleave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use schedgen_crypto::{CipherKey, SharedSecret, decrypt, derive_key, encrypt};
use schedgen_protocol::{DEBUG_FIELD, SessionState, StreamLine};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::classify::{KeywordClassifier, LineClass, LineClassifier};
use crate::debug_dump::DebugDump;
use crate::error::{SessionError, WorkerError};
use crate::worker::{WorkerCommand, WorkerEvent, WorkerExit, WorkerHandle, WorkerInput};

pub const DEFAULT_INPUT_DELAY: Duration = Duration::from_millis(100);

/// Per-process settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub worker: WorkerCommand,
    /// Pause between spawn and the first stdin write. The existing worker
    /// starts polling stdin only after its imports finish; this buffer papers
    /// over that race rather than closing it.
    pub input_delay: Duration,
    /// Kill the worker after this long. `None` lets it run to completion.
    pub timeout: Option<Duration>,
    /// Where to keep a copy of each request while its session runs.
    /// `None` disables the copy.
    pub debug_dump_dir: Option<PathBuf>,
}

impl SessionSettings {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            input_delay: DEFAULT_INPUT_DELAY,
            timeout: None,
            debug_dump_dir: None,
        }
    }

    pub fn with_input_delay(mut self, delay: Duration) -> Self {
        self.input_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_dump_dir = dir;
        self
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    /// Stdout lines appended to the result buffer.
    pub fragments: usize,
    /// Lines delivered to the caller.
    pub lines_sent: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<SessionSettings>,
    secret: SharedSecret,
    classifier: Arc<dyn LineClassifier>,
}

impl Orchestrator {
    pub fn new(settings: SessionSettings, secret: SharedSecret) -> Self {
        Self {
            settings: Arc::new(settings),
            secret,
            classifier: Arc::new(KeywordClassifier::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn LineClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Run one session to its terminal state, writing every caller-facing
    /// line to `sink`.
    ///
    /// Cancelling `cancel`, or dropping the receiving end of `sink`, kills the
    /// worker and ends the session without a terminal line.
    pub async fn run(
        &self,
        body: &[u8],
        sink: mpsc::Sender<StreamLine>,
        cancel: CancellationToken,
    ) -> SessionReport {
        let session_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("session", session_id = %session_id);

        async move {
            let mut session = Session {
                id: session_id,
                state: SessionState::Received,
                sink,
                fragments: 0,
                lines_sent: 0,
            };

            let terminal = match self.drive(&mut session, body, &cancel).await {
                Ok(document) => {
                    session.advance(SessionState::Completed);
                    Some(StreamLine::Document(document))
                }
                Err(err) => {
                    session.advance(SessionState::Failed(err.kind()));
                    match &err {
                        SessionError::Cancelled => info!("session cancelled"),
                        _ => warn!(error = %err, "session failed"),
                    }
                    err.to_line()
                }
            };
            if let Some(line) = terminal {
                session.emit(line).await;
            }

            SessionReport {
                session_id: session.id,
                state: session.state,
                fragments: session.fragments,
                lines_sent: session.lines_sent,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &mut Session,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Value, SessionError> {
        let document = parse_request(body)?;
        session.advance(SessionState::Validated);

        // Dropped, and so deleted, before `run` writes the terminal line.
        let _dump = match &self.settings.debug_dump_dir {
            Some(dir) => match DebugDump::create(dir, &session.id, &document).await {
                Ok(dump) => Some(dump),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "debug dump skipped");
                    None
                }
            },
            None => None,
        };

        let key = derive_key(&self.secret);
        let envelope = encrypt_document(&document, &key)?;
        drop(document);
        session.advance(SessionState::Encrypted);

        let mut worker = WorkerHandle::spawn(&self.settings.worker)
            .map_err(|err| SessionError::Spawn(spawn_detail(&err)))?;
        info!(pid = ?worker.id(), "worker started");
        session.advance(SessionState::WorkerRunning);

        let feeder = worker.take_input().map(|input| {
            tokio::spawn(
                feed_input(
                    input,
                    self.secret.clone(),
                    envelope,
                    self.settings.input_delay,
                )
                .in_current_span(),
            )
        });

        let outcome = self.collect(session, &mut worker, cancel).await;
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let (buffer, exit) = match outcome {
            Ok(collected) => collected,
            Err(err) => {
                if let Err(kill_err) = worker.kill().await {
                    warn!(error = %kill_err, "failed to kill worker");
                }
                return Err(err);
            }
        };

        info!(
            code = ?exit.code,
            signal = ?exit.signal,
            fragments = session.fragments,
            "worker exited"
        );
        finish(exit, &buffer, &key)
    }

    /// Route worker output until both pipes close, then reap the process.
    async fn collect(
        &self,
        session: &mut Session,
        worker: &mut WorkerHandle,
        cancel: &CancellationToken,
    ) -> Result<(String, WorkerExit), SessionError> {
        let deadline = self.settings.timeout.map(|t| Instant::now() + t);
        let mut buffer = String::new();

        loop {
            let step = tokio::select! {
                event = worker.next_event() => Step::Event(event),
                _ = cancel.cancelled() => Step::Cancelled,
                _ = session.sink.closed() => Step::Cancelled,
                _ = deadline_elapsed(deadline) => Step::TimedOut,
            };

            let event = match step {
                Step::Event(Some(event)) => event,
                Step::Event(None) => break,
                Step::Cancelled => return Err(SessionError::Cancelled),
                Step::TimedOut => return Err(self.timeout_error()),
            };

            match event {
                WorkerEvent::Stdout(line) => match self.classifier.classify(&line) {
                    Some(LineClass::Progress(text)) => {
                        debug!(%text, "progress");
                        if !session.emit(StreamLine::Progress(text)).await {
                            return Err(SessionError::Cancelled);
                        }
                    }
                    Some(LineClass::ResultFragment(text)) => {
                        buffer.push_str(&text);
                        session.fragments += 1;
                    }
                    None => {}
                },
                WorkerEvent::Stderr(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !session.emit(StreamLine::Error(line)).await {
                        return Err(SessionError::Cancelled);
                    }
                }
            }
        }

        // A worker may close both pipes and keep running.
        let exit = tokio::select! {
            exit = worker.wait() => exit.map_err(|err| SessionError::Reap(err.to_string()))?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = session.sink.closed() => return Err(SessionError::Cancelled),
            _ = deadline_elapsed(deadline) => return Err(self.timeout_error()),
        };
        Ok((buffer, exit))
    }

    fn timeout_error(&self) -> SessionError {
        SessionError::Timeout(self.settings.timeout.unwrap_or_default())
    }
}

struct Session {
    id: String,
    state: SessionState,
    sink: mpsc::Sender<StreamLine>,
    fragments: usize,
    lines_sent: usize,
}

impl Session {
    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Returns false once the caller has gone away.
    async fn emit(&mut self, line: StreamLine) -> bool {
        if self.sink.send(line).await.is_err() {
            debug!("caller disconnected");
            return false;
        }
        self.lines_sent += 1;
        true
    }
}

enum Step {
    Event(Option<WorkerEvent>),
    Cancelled,
    TimedOut,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn parse_request(body: &[u8]) -> Result<Value, SessionError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SessionError::EmptyBody);
    }
    serde_json::from_slice(body).map_err(SessionError::InvalidJson)
}

fn encrypt_document(document: &Value, key: &CipherKey) -> Result<String, SessionError> {
    let canonical =
        serde_json::to_vec(document).map_err(|err| SessionError::Encryption(err.to_string()))?;
    Ok(encrypt(&canonical, key))
}

fn spawn_detail(err: &WorkerError) -> String {
    match err {
        WorkerError::Spawn { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

/// Stdin contract of the worker: the secret, then the envelope, then EOF.
async fn feed_input(
    mut input: WorkerInput,
    secret: SharedSecret,
    envelope: String,
    delay: Duration,
) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let result = async {
        input.write_line(secret.expose()).await?;
        input.write_line(&envelope).await?;
        input.close_input().await
    }
    .await;
    match result {
        Ok(()) => debug!(bytes = envelope.len(), "worker input delivered"),
        Err(err) => warn!(error = %err, "failed to deliver worker input"),
    }
}

fn finish(exit: WorkerExit, buffer: &str, key: &CipherKey) -> Result<Value, SessionError> {
    match (exit.code, exit.signal) {
        (Some(0), _) => {}
        (Some(code), _) => return Err(SessionError::NonZeroExit(code)),
        (None, Some(signal)) => return Err(SessionError::Signalled(signal)),
        (None, None) => return Err(SessionError::NonZeroExit(-1)),
    }

    let buffer = buffer.trim();
    if buffer.is_empty() {
        return Err(SessionError::NoOutput);
    }

    let plaintext =
        decrypt(buffer, key).map_err(|err| SessionError::decrypt(format!("{err:#}"), buffer))?;
    let mut result: Value = serde_json::from_slice(&plaintext)
        .map_err(|err| SessionError::decrypt(err.to_string(), buffer))?;
    if let Some(object) = result.as_object_mut() {
        object.remove(DEBUG_FIELD);
    }
    Ok(result)
}
