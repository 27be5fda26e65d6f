use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schooltoold");
    let mut child = Command::new(exe)
        .env_remove("SCHOOLTOOLD_WORKSPACE")
        .env_remove("SCHOOLTOOLD_CSV_CHARSET")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schooltoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schooltool-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert!(health["generation"].is_null());

    let no_ws = request(&mut stdin, &mut reader, "2", "persons.list", json!({}));
    assert_eq!(error_code(&no_ws), "no_workspace");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("schooltool.sqlite3").exists());
    let health = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));
    assert_eq!(health["generation"], 2);

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schoolyears.create",
        json!({ "title": "2026-2027", "firstDate": "2026-09-01", "lastDate": "2027-06-30" }),
    );
    let year_id = year["schoolYear"]["id"].as_str().expect("year id").to_string();
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "terms.create",
        json!({ "schoolYearId": year_id, "title": "Fall", "firstDate": "2026-09-01", "lastDate": "2026-12-31" }),
    );
    let term_id = term["term"]["id"].as_str().expect("term id").to_string();

    let _ = request_ok(&mut stdin, &mut reader, "7", "setup.get", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "courses.list",
        json!({ "schoolYearId": year_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sections.list",
        json!({ "termId": term_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "schemas.list",
        json!({ "schoolYearId": year_id }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "11", "persons.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "groups.list",
        json!({ "schoolYearId": year_id }),
    );
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "timetable.importCsv",
        json!({ "termId": term_id, "csv": "" }),
    );
    assert_eq!(rejected["imported"], false);
    assert_eq!(rejected["errors"], json!(["No data provided"]));

    let missing = request(
        &mut stdin,
        &mut reader,
        "14",
        "reports.groupIdCardsModel",
        json!({ "groupId": "nope" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let unknown = request(&mut stdin, &mut reader, "15", "classes.list", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("parse bad_json reply");
    assert_eq!(error_code(&bad), "bad_json");

    // The loop keeps serving after a bad line.
    let _ = request_ok(&mut stdin, &mut reader, "16", "health", json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
