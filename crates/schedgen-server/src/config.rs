use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libschedgen::{SessionSettings, WorkerCommand};
use schedgen_crypto::SharedSecret;
use serde::Deserialize;

pub const SHARED_SECRET_ENV: &str = "SCHEDGEN_SHARED_SECRET";
const DEFAULT_SCRIPT: &str = "CSPxGA.py";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_INPUT_DELAY_MS: u64 = 100;

#[derive(Parser, Debug, Default)]
#[command(
    name = "schedgen-server",
    about = "Streams schedule generation progress from a Python worker"
)]
pub struct Cli {
    /// TOML config file (default: $XDG_CONFIG_HOME/schedgen/config.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "SCHEDGEN_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Port on all interfaces; ignored when --listen is given
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Worker script passed to the interpreter
    #[arg(long, env = "SCHEDGEN_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Interpreter to run the worker with (default: first working python on PATH)
    #[arg(long, env = "SCHEDGEN_PYTHON")]
    pub python: Option<PathBuf>,

    /// File holding the shared secret; overrides $SCHEDGEN_SHARED_SECRET
    #[arg(long)]
    pub shared_secret_file: Option<PathBuf>,

    /// Keep a copy of each request here while its session runs
    #[arg(long, env = "SCHEDGEN_DEBUG_DUMP_DIR")]
    pub debug_dump_dir: Option<PathBuf>,

    /// Delay between spawning the worker and writing its input
    #[arg(long)]
    pub input_delay_ms: Option<u64>,

    /// Kill workers that run longer than this
    #[arg(long)]
    pub worker_timeout_secs: Option<u64>,

    /// Allowed CORS origin; repeat for several. Default allows any.
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
}

/// On-disk configuration. Every field is optional; the CLI wins on conflict.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub script: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub shared_secret: Option<String>,
    pub shared_secret_file: Option<PathBuf>,
    pub input_delay_ms: Option<u64>,
    pub worker_timeout_secs: Option<u64>,
    pub debug_dump_dir: Option<PathBuf>,
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub script: PathBuf,
    pub python: Option<PathBuf>,
    pub shared_secret: SharedSecret,
    pub input_delay: Duration,
    pub worker_timeout: Option<Duration>,
    pub debug_dump_dir: Option<PathBuf>,
    pub allow_origins: Vec<String>,
}

impl ServerConfig {
    /// Merge CLI, environment and the config file, in that order of precedence.
    pub fn load(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    FileConfig::load(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        let env_secret = std::env::var(SHARED_SECRET_ENV).ok();
        Self::resolve(cli, file, env_secret)
    }

    pub fn resolve(cli: Cli, file: FileConfig, env_secret: Option<String>) -> Result<Self> {
        let listen = cli
            .listen
            .or_else(|| cli.port.map(|port| SocketAddr::from(([0, 0, 0, 0], port))))
            .or(file.listen)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));

        let shared_secret = match cli.shared_secret_file.or(file.shared_secret_file) {
            Some(path) => read_secret_file(&path)?,
            None => match env_secret.or(file.shared_secret) {
                Some(secret) => secret,
                None => bail!(
                    "no shared secret configured; set {SHARED_SECRET_ENV}, --shared-secret-file, or shared_secret in the config file"
                ),
            },
        };
        if shared_secret.is_empty() {
            bail!("shared secret must not be empty");
        }

        let allow_origins = if cli.allow_origins.is_empty() {
            file.allow_origins
        } else {
            cli.allow_origins
        };

        Ok(Self {
            listen,
            script: cli
                .script
                .or(file.script)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT)),
            python: cli.python.or(file.python),
            shared_secret: SharedSecret::new(shared_secret),
            input_delay: Duration::from_millis(
                cli.input_delay_ms
                    .or(file.input_delay_ms)
                    .unwrap_or(DEFAULT_INPUT_DELAY_MS),
            ),
            worker_timeout: cli
                .worker_timeout_secs
                .or(file.worker_timeout_secs)
                .map(Duration::from_secs),
            debug_dump_dir: cli.debug_dump_dir.or(file.debug_dump_dir),
            allow_origins,
        })
    }

    /// Session settings for workers launched as `<interpreter> <script>`.
    pub fn session_settings(&self, interpreter: PathBuf) -> SessionSettings {
        SessionSettings::new(WorkerCommand::new(interpreter).arg(&self.script))
            .with_input_delay(self.input_delay)
            .with_timeout(self.worker_timeout)
            .with_debug_dump_dir(self.debug_dump_dir.clone())
    }
}

fn read_secret_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read shared secret {}", path.display()))?;
    Ok(raw.trim_end_matches(['\n', '\r']).to_string())
}

pub fn default_config_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("schedgen").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("schedgen")
            .join("config.toml")
    } else {
        PathBuf::from("/etc/schedgen/config.toml")
    }
}
