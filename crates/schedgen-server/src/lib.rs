pub mod config;
pub mod routes;

pub use config::{Cli, FileConfig, ServerConfig};
pub use routes::{AppState, build_cors, router};
