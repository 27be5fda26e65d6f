use rusqlite::Connection;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// A required, non-empty string parameter (trimmed).
pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if v.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(v)
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
}

/// A required array of strings, e.g. `personIds`.
pub fn required_str_list(req: &Request, key: &str) -> Result<Vec<String>, serde_json::Value> {
    let Some(arr) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an array of strings", key),
            None,
        ));
    };
    arr.iter()
        .map(|v| {
            v.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must be an array of strings", key),
                    None,
                )
            })
        })
        .collect()
}

pub fn query_failed(req: &Request, e: impl std::fmt::Display) -> serde_json::Value {
    err(&req.id, "db_query_failed", e.to_string(), None)
}
