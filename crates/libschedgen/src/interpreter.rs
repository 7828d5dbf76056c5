use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// An interpreter that answered `--version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: PathBuf,
    pub version: String,
}

pub fn default_candidates() -> &'static [&'static str] {
    if cfg!(windows) {
        &["python", "python3", "py"]
    } else {
        &["python3", "python"]
    }
}

/// Return the first candidate that runs `--version` successfully.
pub async fn find_python(candidates: &[&str]) -> Result<Interpreter> {
    for candidate in candidates {
        if let Some(version) = probe(candidate).await {
            info!(interpreter = %candidate, %version, "found python");
            return Ok(Interpreter {
                program: PathBuf::from(candidate),
                version,
            });
        }
    }
    bail!("Python not found. Please install Python 3.x and ensure it's in your PATH")
}

/// Use the configured interpreter if there is one, checking that it answers
/// `--version`. Otherwise search [`default_candidates`].
pub async fn resolve_python(configured: Option<&Path>) -> Result<Interpreter> {
    let Some(program) = configured else {
        return find_python(default_candidates()).await;
    };
    let candidate = program.to_string_lossy();
    match probe(&candidate).await {
        Some(version) => {
            info!(interpreter = %candidate, %version, "using configured python");
            Ok(Interpreter {
                program: program.to_path_buf(),
                version,
            })
        }
        None => bail!("configured Python interpreter {candidate} did not answer --version"),
    }
}

async fn probe(candidate: &str) -> Option<String> {
    let mut cmd = Command::new(candidate);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            debug!(%candidate, error = %err, "interpreter probe failed");
            return None;
        }
        Err(_) => {
            debug!(%candidate, "interpreter probe timed out");
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }

    // Python 2 reports its version on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        Some(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Some(stdout)
    }
}
