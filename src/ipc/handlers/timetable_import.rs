use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{load_section, SetupSection};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::timetable_csv::{present_errors, ImportError, TimetableCsvImporter};
use serde_json::json;
use std::borrow::Cow;
use std::path::PathBuf;

fn handle_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let dry_run = req
        .params
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let import_setup = match load_section(conn, SetupSection::Import) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let max_bytes = import_setup
        .get("maxBytes")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX);
    let too_big = |bytes: u64| {
        err(
            &req.id,
            "bad_params",
            format!("csv exceeds {} bytes", max_bytes),
            Some(json!({ "maxBytes": max_bytes, "bytes": bytes })),
        )
    };

    // Text arrives already decoded; only raw file bytes carry a charset.
    let text = req.params.get("csv").and_then(|v| v.as_str());
    let path = optional_str(req, "path").filter(|p| !p.is_empty());
    let (bytes, charset): (Cow<'_, [u8]>, Option<String>) = match (text, path) {
        (Some(_), Some(_)) => {
            return err(&req.id, "bad_params", "pass either csv or path, not both", None)
        }
        (None, None) => return err(&req.id, "bad_params", "missing csv or path", None),
        (Some(csv), None) => {
            if optional_str(req, "charset").is_some_and(|c| !c.is_empty()) {
                return err(
                    &req.id,
                    "bad_params",
                    "charset applies to path input only",
                    None,
                );
            }
            if csv.len() as u64 > max_bytes {
                return too_big(csv.len() as u64);
            }
            (Cow::Borrowed(csv.as_bytes()), None)
        }
        (None, Some(path)) => {
            let path = PathBuf::from(path);
            let len = match std::fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(e) => {
                    return err(
                        &req.id,
                        "not_found",
                        format!("cannot read {}: {}", path.display(), e),
                        None,
                    )
                }
            };
            if len > max_bytes {
                return too_big(len);
            }
            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("cannot read {}: {}", path.display(), e),
                        None,
                    )
                }
            };
            // Request, then workspace setup, then process environment.
            let charset = optional_str(req, "charset")
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    import_setup
                        .get("defaultCharset")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .or_else(|| state.config.csv_charset.clone());
            (Cow::Owned(data), charset)
        }
    };

    let mut importer = match TimetableCsvImporter::new(conn, &term_id, charset.as_deref()) {
        Ok(i) => i,
        Err(ImportError::TermNotFound(_)) => {
            return err(&req.id, "not_found", "term not found", None)
        }
        Err(e @ ImportError::UnknownCharset(_)) => {
            return err(&req.id, "bad_params", e.to_string(), None)
        }
        Err(e) => return query_failed(req, e),
    };

    if dry_run {
        return match importer.validate(&bytes) {
            Ok(()) => ok(
                &req.id,
                json!({
                    "imported": false,
                    "dryRun": true,
                    "errors": [],
                    "errorCollection": importer.errors(),
                }),
            ),
            Err(ImportError::Invalid) => rejected(req, &importer, true),
            Err(e) => query_failed(req, e),
        };
    }

    if importer.import_from_csv(&bytes) {
        return ok(
            &req.id,
            json!({
                "imported": true,
                "dryRun": false,
                "errors": [],
                "errorCollection": importer.errors(),
                "summary": importer.summary(),
            }),
        );
    }
    match importer.aborted() {
        Some(reason) => err(
            &req.id,
            "import_fatal",
            reason,
            Some(json!({
                "errors": present_errors(importer.errors()),
                "errorCollection": importer.errors(),
            })),
        ),
        None => rejected(req, &importer, false),
    }
}

fn rejected(req: &Request, importer: &TimetableCsvImporter<'_>, dry_run: bool) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "imported": false,
            "dryRun": dry_run,
            "errors": present_errors(importer.errors()),
            "errorCollection": importer.errors(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.importCsv" => Some(handle_import_csv(state, req)),
        _ => None,
    }
}
