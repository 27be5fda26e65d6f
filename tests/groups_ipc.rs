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

fn create_person(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    first: &str,
    last: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("person-{}", username),
        "persons.create",
        json!({ "username": username, "firstName": first, "lastName": last }),
    );
    created["person"]["id"].as_str().expect("person id").to_string()
}

#[test]
fn groups_membership_leaders_and_id_cards() {
    let workspace = temp_dir("schooltool-groups");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schoolyears.create",
        json!({ "title": "2026-2027", "firstDate": "2026-09-01", "lastDate": "2027-06-30" }),
    );
    let year_id = year["schoolYear"]["id"].as_str().expect("year id").to_string();

    let zoe = create_person(&mut stdin, &mut reader, "zoe", "Zoe", "Adams");
    let ben = create_person(&mut stdin, &mut reader, "ben", "Ben", "Young");
    let kim = create_person(&mut stdin, &mut reader, "kim", "Kim", "Lee");

    let chess = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "groups.create",
        json!({ "schoolYearId": year_id, "title": "Chess Club", "description": "Thursdays" }),
    );
    assert_eq!(chess["name"], "chess-club");
    let chess_id = chess["groupId"].as_str().expect("group id").to_string();
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "groups.create",
        json!({ "schoolYearId": year_id, "title": "Chess Club" }),
    );
    assert_eq!(again["name"], "chess-club-2");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "groups.create",
        json!({ "schoolYearId": year_id, "title": "Art" }),
    );

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "groups.list",
        json!({ "schoolYearId": year_id, "filter": "CHESS" }),
    );
    assert_eq!(filtered["groups"].as_array().map(|a| a.len()), Some(2));
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "groups.list",
        json!({ "schoolYearId": year_id }),
    );
    assert_eq!(all["groups"][0]["title"], "Art");

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "groups.members.add",
        json!({ "groupId": chess_id, "personIds": [ben, zoe] }),
    );
    assert_eq!(added["added"], 2);
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "groups.members.add",
        json!({ "groupId": chess_id, "personIds": [zoe] }),
    );
    assert_eq!(added["added"], 0);
    let unknown = request(
        &mut stdin,
        &mut reader,
        "10",
        "groups.members.add",
        json!({ "groupId": chess_id, "personIds": ["ghost"] }),
    );
    assert_eq!(error_code(&unknown), "not_found");
    assert_eq!(unknown["error"]["details"]["personIds"], json!(["ghost"]));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "groups.leaders.add",
        json!({ "groupId": chess_id, "personIds": [kim] }),
    );

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "groups.get",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(detail["hasMembers"], true);
    assert_eq!(detail["hasLeaders"], true);
    assert_eq!(detail["group"]["schoolYear"], "2026-2027");
    let member_names: Vec<&str> = detail["members"]
        .as_array()
        .expect("members")
        .iter()
        .filter_map(|m| m["username"].as_str())
        .collect();
    assert_eq!(member_names, vec!["zoe", "ben"]);

    let available = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "groups.available",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(available["persons"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(available["persons"][0]["username"], "kim");

    let cards = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "reports.groupIdCardsModel",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(cards["title"], "ID Cards for Group: Chess Club");
    assert_eq!(cards["filename"], "id_cards_chess-club_2026-2027.pdf");
    assert_eq!(cards["cards"][0]["username"], "zoe");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "setup.update",
        json!({ "section": "reports", "patch": { "idCardsSortBy": "firstName", "idCardsIncludeUsername": false } }),
    );
    let cards = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "reports.groupIdCardsModel",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(cards["cards"][0]["firstName"], "Ben");
    assert!(cards["cards"][0].get("username").is_none());

    let groups_of_zoe = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "persons.groups",
        json!({ "personId": zoe }),
    );
    assert_eq!(groups_of_zoe["groups"][0]["title"], "Chess Club");
    assert_eq!(groups_of_zoe["groups"][0]["schoolYear"], "2026-2027");

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "groups.members.remove",
        json!({ "groupId": chess_id, "personIds": [zoe, kim] }),
    );
    assert_eq!(removed["removed"], 1);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "groups.update",
        json!({ "groupId": chess_id, "title": "Chess", "description": null }),
    );
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "groups.get",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(detail["group"]["title"], "Chess");
    assert!(detail["group"]["description"].is_null());
    assert_eq!(detail["group"]["name"], "chess-club");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "groups.delete",
        json!({ "groupId": chess_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "22",
        "groups.get",
        json!({ "groupId": chess_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
