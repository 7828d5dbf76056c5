use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::WorkerError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Program and arguments used to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// One line read from the worker, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Stdout(String),
    Stderr(String),
}

/// How the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Writable end of the worker's stdin.
pub struct WorkerInput {
    stdin: ChildStdin,
}

impl WorkerInput {
    pub async fn write_input(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
        self.stdin.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), WorkerError> {
        self.write_input(line.as_bytes()).await?;
        self.write_input(b"\n").await
    }

    /// Flush and close stdin so the worker sees EOF.
    pub async fn close_input(mut self) -> Result<(), WorkerError> {
        self.stdin.flush().await?;
        self.stdin.shutdown().await?;
        Ok(())
    }
}

/// A spawned worker process with piped stdio.
///
/// stdout and stderr are drained by background tasks into a single event
/// source, so neither pipe can fill up while the caller is busy elsewhere.
/// [`WorkerHandle::next_event`] returns `None` once both have reached EOF.
pub struct WorkerHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    pub fn spawn(command: &WorkerCommand) -> Result<Self, WorkerError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(WorkerError::MissingPipe("stderr"))?;

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(forward_lines(stdout, event_tx.clone(), WorkerEvent::Stdout));
        tokio::spawn(forward_lines(stderr, event_tx, WorkerEvent::Stderr));

        debug!(pid = ?child.id(), program = %command.program.display(), "worker spawned");
        Ok(Self {
            child,
            stdin,
            events,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Hand out stdin so input can be written from another task.
    pub fn take_input(&mut self) -> Option<WorkerInput> {
        self.stdin.take().map(|stdin| WorkerInput { stdin })
    }

    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Wait for the process to exit and reap it.
    pub async fn wait(&mut self) -> Result<WorkerExit, WorkerError> {
        let status = self.child.wait().await?;
        Ok(status.into())
    }

    /// Kill the process and reap it. A worker that already exited is not an error.
    pub async fn kill(&mut self) -> Result<(), WorkerError> {
        self.stdin = None;
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn forward_lines<R>(
    stream: R,
    tx: mpsc::Sender<WorkerEvent>,
    wrap: fn(String) -> WorkerEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(wrap(line)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "worker pipe read failed");
                break;
            }
        }
    }
}
