use clap::Parser;
use std::path::PathBuf;

/// Startup options. Everything else arrives over the IPC channel.
#[derive(Debug, Parser, Clone)]
#[command(name = "reportcardd", version, about = "Report card grading daemon (JSON lines over stdio)")]
pub struct Config {
    /// Workspace directory to open before the first request.
    #[clap(long, env = "REPORTCARDD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    #[clap(long, env = "REPORTCARDD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
