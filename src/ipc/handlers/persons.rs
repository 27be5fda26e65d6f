use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::persons::{self, NewPerson, Person, Preferences};
use rusqlite::Connection;
use serde_json::{json, Value};

fn load_or_not_found(
    conn: &Connection,
    req: &Request,
    person_id: &str,
) -> Result<Person, serde_json::Value> {
    match persons::load_person(conn, person_id) {
        Ok(Some(p)) => Ok(p),
        Ok(None) => Err(err(&req.id, "not_found", "person not found", None)),
        Err(e) => Err(query_failed(req, e)),
    }
}

fn handle_persons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match persons::list_persons(conn) {
        Ok(list) => ok(&req.id, json!({ "persons": list })),
        Err(e) => query_failed(req, e),
    }
}

fn handle_persons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = optional_str(req, "firstName").unwrap_or_default();
    let last_name = optional_str(req, "lastName").unwrap_or_default();
    if first_name.is_empty() && last_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "firstName or lastName is required",
            None,
        );
    }
    let title = optional_str(req, "title");
    let password = req.params.get("password").and_then(|v| v.as_str());

    match crate::school::find_person(conn, &username) {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                format!("username {} is taken", username),
                None,
            )
        }
        Ok(None) => {}
        Err(e) => return query_failed(req, e),
    }

    let new = NewPerson {
        username: &username,
        first_name: &first_name,
        last_name: &last_name,
        title: title.as_deref(),
    };
    let person = match persons::create_person(conn, &new) {
        Ok(p) => p,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "persons" })),
            )
        }
    };
    if let Some(pw) = password {
        if let Err(e) = persons::set_password(conn, &person.id, Some(pw)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    tracing::info!(username = %person.username, "person created");

    match persons::load_person(conn, &person.id) {
        Ok(Some(p)) => ok(&req.id, json!({ "person": p })),
        Ok(None) => err(&req.id, "not_found", "person not found", None),
        Err(e) => query_failed(req, e),
    }
}

fn handle_persons_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_or_not_found(conn, req, &person_id) {
        Ok(p) => ok(&req.id, json!({ "person": p })),
        Err(e) => e,
    }
}

fn handle_persons_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current = match load_or_not_found(conn, req, &person_id) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let first_name = optional_str(req, "firstName").unwrap_or(current.first_name.clone());
    let last_name = optional_str(req, "lastName").unwrap_or(current.last_name.clone());
    let names_changed = first_name != current.first_name || last_name != current.last_name;
    let title = match optional_str(req, "title") {
        Some(t) if !t.is_empty() => t,
        Some(_) => persons::display_title(&first_name, &last_name),
        // A title that was derived from the names follows them.
        None if current.title == persons::display_title(&current.first_name, &current.last_name) => {
            persons::display_title(&first_name, &last_name)
        }
        None => current.title.clone(),
    };
    let clear_photo = req
        .params
        .get("clearPhoto")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE persons SET first_name = ?, last_name = ?, title = ? WHERE id = ?",
        (&first_name, &last_name, &title, &person_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if names_changed {
        if let Err(e) = tx.execute(
            "UPDATE contacts SET first_name = ?, last_name = ? WHERE person_id = ?",
            (&first_name, &last_name, &person_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "contacts" })),
            );
        }
    }
    if clear_photo {
        if let Err(e) = tx.execute("UPDATE persons SET photo = NULL WHERE id = ?", [&person_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match load_or_not_found(conn, req, &person_id) {
        Ok(p) => ok(&req.id, json!({ "person": p })),
        Err(e) => e,
    }
}

fn handle_persons_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let person = match load_or_not_found(conn, req, &person_id) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // No ON DELETE CASCADE; links go first.
    for table in [
        "group_members",
        "group_leaders",
        "section_members",
        "section_instructors",
        "person_preferences",
        "contacts",
        "persons",
    ] {
        let column = if table == "persons" { "id" } else { "person_id" };
        let sql = format!("DELETE FROM {} WHERE {} = ?", table, column);
        if let Err(e) = tx.execute(&sql, [&person_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(username = %person.username, "person deleted");
    ok(&req.id, json!({ "ok": true }))
}

fn handle_persons_set_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password = match req.params.get("password") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
        Some(Value::Null) | None => None,
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "password must be a non-empty string or null",
                None,
            )
        }
    };
    match persons::set_password(conn, &person_id, password) {
        Ok(true) => ok(&req.id, json!({ "hasPassword": password.is_some() })),
        Ok(false) => err(&req.id, "not_found", "person not found", None),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_persons_check_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing password", None);
    };
    if let Err(e) = load_or_not_found(conn, req, &person_id) {
        return e;
    }
    match persons::check_password(conn, &person_id, password) {
        Ok(valid) => ok(&req.id, json!({ "valid": valid })),
        Err(e) => query_failed(req, e),
    }
}

fn effective_preferences(
    conn: &Connection,
    person_id: &str,
) -> anyhow::Result<(Preferences, bool)> {
    match persons::get_preferences(conn, person_id)? {
        Some(p) => Ok((p, false)),
        None => Ok((setup::default_preferences(conn)?, true)),
    }
}

fn handle_preferences_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_or_not_found(conn, req, &person_id) {
        return e;
    }
    match effective_preferences(conn, &person_id) {
        Ok((prefs, is_default)) => ok(
            &req.id,
            json!({ "preferences": prefs, "isDefault": is_default }),
        ),
        Err(e) => query_failed(req, e),
    }
}

fn handle_preferences_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    if let Err(e) = load_or_not_found(conn, req, &person_id) {
        return e;
    }
    let current = match effective_preferences(conn, &person_id) {
        Ok((p, _)) => p,
        Err(e) => return query_failed(req, e),
    };

    let mut merged = match serde_json::to_value(&current) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    for (k, v) in patch {
        let v = match (k.as_str(), v.as_str()) {
            ("weekStart", Some(name)) => match persons::week_start_from_name(name) {
                Some(n) => Value::from(n),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("unknown weekStart: {}", name),
                        None,
                    )
                }
            },
            _ => v.clone(),
        };
        merged[k.as_str()] = v;
    }
    let prefs: Preferences = match serde_json::from_value(merged) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    if let Err(msg) = prefs.validate() {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = persons::set_preferences(conn, &person_id, &prefs) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "preferences": prefs }))
}

fn handle_persons_groups(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_or_not_found(conn, req, &person_id) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.name, g.title, g.description, sy.id, sy.title
         FROM group_members gm
         JOIN groups g ON g.id = gm.group_id
         JOIN school_years sy ON sy.id = g.school_year_id
         WHERE gm.person_id = ?
         ORDER BY sy.first_date, g.title",
    ) {
        Ok(s) => s,
        Err(e) => return query_failed(req, e),
    };
    let rows = stmt
        .query_map([&person_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "description": row.get::<_, Option<String>>(3)?,
                "schoolYearId": row.get::<_, String>(4)?,
                "schoolYear": row.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => query_failed(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "persons.list" => Some(handle_persons_list(state, req)),
        "persons.create" => Some(handle_persons_create(state, req)),
        "persons.get" => Some(handle_persons_get(state, req)),
        "persons.update" => Some(handle_persons_update(state, req)),
        "persons.delete" => Some(handle_persons_delete(state, req)),
        "persons.setPassword" => Some(handle_persons_set_password(state, req)),
        "persons.checkPassword" => Some(handle_persons_check_password(state, req)),
        "persons.preferences.get" => Some(handle_preferences_get(state, req)),
        "persons.preferences.set" => Some(handle_preferences_set(state, req)),
        "persons.groups" => Some(handle_persons_groups(state, req)),
        _ => None,
    }
}
