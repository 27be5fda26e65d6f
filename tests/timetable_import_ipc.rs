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

const TIMETABLE_CSV: &str = "weekly\n\
                             \n\
                             philosophy,lorch\n\
                             Monday,A\n\
                             Tuesday,D\n\
                             ***\n\
                             alice\n\
                             bob\n\
                             \n\
                             history,guzman\n\
                             Tuesday,C\n\
                             ***\n\
                             bob\n";

struct School {
    term_id: String,
}

fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let year = request_ok(
        stdin,
        reader,
        "seed-1",
        "schoolyears.create",
        json!({ "title": "2026-2027", "firstDate": "2026-09-01", "lastDate": "2027-06-30" }),
    );
    let year_id = year["schoolYear"]["id"].as_str().expect("year id").to_string();
    let term = request_ok(
        stdin,
        reader,
        "seed-2",
        "terms.create",
        json!({ "schoolYearId": year_id, "title": "Fall", "firstDate": "2026-09-01", "lastDate": "2026-12-31" }),
    );
    let term_id = term["term"]["id"].as_str().expect("term id").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-3",
        "schemas.create",
        json!({
            "schoolYearId": year_id,
            "name": "weekly",
            "title": "Weekly",
            "days": [
                { "id": "Monday", "periods": ["A", "B"] },
                { "id": "Tuesday", "periods": ["C", "D"] }
            ]
        }),
    );
    for (i, (name, title)) in [("philosophy", "Philosophy"), ("history", "History")]
        .into_iter()
        .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-course-{}", i),
            "courses.create",
            json!({ "schoolYearId": year_id, "name": name, "title": title }),
        );
    }
    for (i, (username, first, last, title)) in [
        ("lorch", "Adam", "Lorch", Some("Mr. Lorch")),
        ("guzman", "Ana", "Guzman", None),
        ("alice", "Alice", "Smith", None),
        ("bob", "Bob", "Jones", None),
    ]
    .into_iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-person-{}", i),
            "persons.create",
            json!({ "username": username, "firstName": first, "lastName": last, "title": title }),
        );
    }
    School { term_id }
}

#[test]
fn timetable_import_dry_run_then_commit_then_reuse() {
    let workspace = temp_dir("schooltool-timetable-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": TIMETABLE_CSV, "dryRun": true }),
    );
    assert_eq!(dry["imported"], false);
    assert_eq!(dry["dryRun"], true);
    assert_eq!(dry["errors"], json!([]));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sections.list",
        json!({ "termId": school.term_id }),
    );
    assert_eq!(listed["sections"].as_array().map(|a| a.len()), Some(0));

    let done = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": TIMETABLE_CSV }),
    );
    assert_eq!(done["imported"], true);
    assert_eq!(
        done["summary"]["sectionsCreated"],
        json!(["Philosophy - Mr. Lorch", "History - Ana Guzman"])
    );
    assert_eq!(done["summary"]["activitiesAdded"], 3);
    assert_eq!(done["summary"]["membersEnrolled"], 3);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sections.list",
        json!({ "termId": school.term_id }),
    );
    let sections = listed["sections"].as_array().expect("sections").clone();
    assert_eq!(sections.len(), 2);
    let philosophy = sections
        .iter()
        .find(|s| s["title"] == "Philosophy - Mr. Lorch")
        .expect("philosophy section");
    assert_eq!(philosophy["memberCount"], 2);

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sections.get",
        json!({ "sectionId": philosophy["id"] }),
    );
    assert_eq!(detail["courses"][0]["name"], "philosophy");
    assert_eq!(detail["instructors"][0]["username"], "lorch");
    assert_eq!(detail["timetables"][0]["name"], "fall.weekly");
    assert_eq!(detail["timetables"][0]["schema"], "weekly");
    assert_eq!(
        detail["timetables"][0]["activities"],
        json!([
            { "dayId": "Monday", "periodId": "A", "title": "Philosophy" },
            { "dayId": "Tuesday", "periodId": "D", "title": "Philosophy" }
        ])
    );

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": TIMETABLE_CSV }),
    );
    assert_eq!(again["imported"], true);
    assert_eq!(again["summary"]["sectionsCreated"], json!([]));
    assert_eq!(again["summary"]["sectionsReused"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(again["summary"]["activitiesAdded"], 0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn timetable_import_reports_every_problem_and_guards_params() {
    let workspace = temp_dir("schooltool-timetable-errors");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let bad_csv = "weekly\n\
                   \n\
                   chemistry,lorch\n\
                   Friday,A\n\
                   Monday,Z\n\
                   ***\n\
                   zed\n\
                   zed\n";
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": bad_csv }),
    );
    assert_eq!(rejected["imported"], false);
    assert_eq!(rejected["errorCollection"]["courses"], json!(["chemistry"]));
    assert_eq!(rejected["errorCollection"]["dayIds"], json!(["Friday"]));
    assert_eq!(rejected["errorCollection"]["persons"], json!(["zed"]));
    let messages: Vec<String> = rejected["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .filter_map(|m| m.as_str().map(str::to_string))
        .collect();
    assert!(messages.contains(&"Persons not found: zed.".to_string()));
    assert!(messages.contains(&"Courses not found: chemistry.".to_string()));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sections.list",
        json!({ "termId": school.term_id }),
    );
    assert_eq!(listed["sections"].as_array().map(|a| a.len()), Some(0));

    let no_term = request(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.importCsv",
        json!({ "termId": "missing", "csv": TIMETABLE_CSV }),
    );
    assert_eq!(error_code(&no_term), "not_found");

    let csv_path = workspace.join("timetable.csv");
    std::fs::write(&csv_path, TIMETABLE_CSV).expect("write csv file");
    let bad_charset = request(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "path": csv_path.to_string_lossy(), "charset": "klingon" }),
    );
    assert_eq!(error_code(&bad_charset), "bad_params");
    let both = request(
        &mut stdin,
        &mut reader,
        "5b",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": TIMETABLE_CSV, "path": csv_path.to_string_lossy() }),
    );
    assert_eq!(error_code(&both), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "section": "import", "patch": { "maxBytes": 1024 } }),
    );
    let big = format!("{}{}", TIMETABLE_CSV, "\n".repeat(2048));
    let too_big = request(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": big }),
    );
    assert_eq!(error_code(&too_big), "bad_params");
    assert_eq!(too_big["error"]["details"]["maxBytes"], 1024);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn timetable_import_decodes_only_file_input_with_default_charset() {
    let workspace = temp_dir("schooltool-timetable-charset");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "persons.create",
        json!({ "username": "jos\u{e9}", "firstName": "Jos\u{e9}", "lastName": "Ruiz" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "import", "patch": { "defaultCharset": "latin1" } }),
    );

    // JSON text is already Unicode, so the latin1 default must not apply.
    let text = "weekly\n\nphilosophy,lorch\nMonday,A\n***\njos\u{e9}\n";
    let from_text = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "csv": text }),
    );
    assert_eq!(from_text["imported"], true, "{}", from_text);
    assert_eq!(from_text["summary"]["membersEnrolled"], 1);

    let mut latin1 = b"weekly\n\nhistory,guzman\nTuesday,C\n***\njos".to_vec();
    latin1.extend_from_slice(&[0xe9, b'\n']);
    let csv_path = workspace.join("latin1.csv");
    std::fs::write(&csv_path, &latin1).expect("write csv file");
    let from_file = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "path": csv_path.to_string_lossy() }),
    );
    assert_eq!(from_file["imported"], true, "{}", from_file);
    assert_eq!(from_file["summary"]["membersEnrolled"], 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sections.list",
        json!({ "termId": school.term_id }),
    );
    assert_eq!(listed["sections"].as_array().map(|a| a.len()), Some(2));

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.importCsv",
        json!({ "termId": school.term_id, "path": workspace.join("nope.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
