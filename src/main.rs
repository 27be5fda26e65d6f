mod config;
mod db;
mod generations;
mod ipc;
mod logging;
mod persons;
mod school;
mod timetable_csv;

use std::io::{self, BufRead, Write};

fn main() {
    let config = config::DaemonConfig::from_env();
    logging::init_logging(&config);

    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        match ipc::open_workspace(&mut state, &path) {
            Ok(()) => tracing::info!(path = %path.display(), "workspace opened from environment"),
            Err(e) => tracing::warn!(path = %path.display(), error = ?e, "workspace open failed"),
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "schooltoold ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
