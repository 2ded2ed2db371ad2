mod backup;
mod config;
mod db;
mod grading;
mod ipc;
mod logging;
mod reports;
mod tenant;

use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};

fn main() {
    let cfg = config::Config::parse();
    logging::init_tracing(&cfg.log_level);

    let mut state = ipc::AppState::default();
    if let Some(workspace) = cfg.workspace.as_deref() {
        if let Err(e) = ipc::select_workspace(&mut state, workspace) {
            tracing::error!(workspace = %workspace.display(), error = %format!("{e:#}"), "failed to open workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                // No id to echo back.
                json!({
                    "id": serde_json::Value::Null,
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };
        let _ = writeln!(stdout, "{}", resp);
        let _ = stdout.flush();
    }
}
