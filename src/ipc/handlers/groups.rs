use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str, required_str_list};
use crate::ipc::types::{AppState, Request};
use crate::persons;
use crate::school;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct GroupRow {
    id: String,
    school_year_id: String,
    name: String,
    title: String,
    description: Option<String>,
}

fn load_group(conn: &Connection, group_id: &str) -> rusqlite::Result<Option<GroupRow>> {
    conn.query_row(
        "SELECT id, school_year_id, name, title, description FROM groups WHERE id = ?",
        [group_id],
        |r| {
            Ok(GroupRow {
                id: r.get(0)?,
                school_year_id: r.get(1)?,
                name: r.get(2)?,
                title: r.get(3)?,
                description: r.get(4)?,
            })
        },
    )
    .optional()
}

fn group_or_not_found(
    conn: &Connection,
    req: &Request,
) -> Result<GroupRow, serde_json::Value> {
    let group_id = required_str(req, "groupId")?;
    match load_group(conn, &group_id) {
        Ok(Some(g)) => Ok(g),
        Ok(None) => Err(err(&req.id, "not_found", "group not found", None)),
        Err(e) => Err(query_failed(req, e)),
    }
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filter = optional_str(req, "filter")
        .filter(|f| !f.is_empty())
        .map(|f| f.to_lowercase());

    let mut stmt = match conn.prepare(
        "SELECT
           g.id,
           g.name,
           g.title,
           g.description,
           (SELECT COUNT(*) FROM group_members gm WHERE gm.group_id = g.id) AS member_count,
           (SELECT COUNT(*) FROM group_leaders gl WHERE gl.group_id = g.id) AS leader_count
         FROM groups g
         WHERE g.school_year_id = ?
         ORDER BY g.title COLLATE NOCASE, g.name",
    ) {
        Ok(s) => s,
        Err(e) => return query_failed(req, e),
    };
    let rows = stmt
        .query_map([&school_year_id], |row| {
            Ok((
                row.get::<_, String>(2)?,
                json!({
                    "id": row.get::<_, String>(0)?,
                    "name": row.get::<_, String>(1)?,
                    "title": row.get::<_, String>(2)?,
                    "description": row.get::<_, Option<String>>(3)?,
                    "memberCount": row.get::<_, i64>(4)?,
                    "leaderCount": row.get::<_, i64>(5)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => {
            let groups: Vec<serde_json::Value> = rows
                .into_iter()
                .filter(|(title, _)| match &filter {
                    Some(f) => title.to_lowercase().contains(f.as_str()),
                    None => true,
                })
                .map(|(_, g)| g)
                .collect();
            ok(&req.id, json!({ "groups": groups }))
        }
        Err(e) => query_failed(req, e),
    }
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = optional_str(req, "description").filter(|d| !d.is_empty());

    match school::load_school_year(conn, &school_year_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "school year not found", None),
        Err(e) => return query_failed(req, e),
    }
    let taken = match db::taken_names(conn, "groups", "school_year_id", &school_year_id) {
        Ok(t) => t,
        Err(e) => return query_failed(req, e),
    };
    let name = db::choose_name(&taken, &title);
    let group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO groups(id, school_year_id, name, title, description) VALUES(?, ?, ?, ?, ?)",
        (&group_id, &school_year_id, &name, &title, &description),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "groups" })),
        );
    }

    ok(
        &req.id,
        json!({ "groupId": group_id, "name": name, "title": title }),
    )
}

fn handle_groups_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group = match group_or_not_found(conn, req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let year = match school::load_school_year(conn, &group.school_year_id) {
        Ok(y) => y,
        Err(e) => return query_failed(req, e),
    };
    let members = match persons::linked_persons(conn, "group_members", "group_id", &group.id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let leaders = match persons::linked_persons(conn, "group_leaders", "group_id", &group.id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };

    ok(
        &req.id,
        json!({
            "group": {
                "id": group.id,
                "name": group.name,
                "title": group.title,
                "description": group.description,
                "schoolYearId": group.school_year_id,
                "schoolYear": year.map(|y| y.title),
            },
            "hasMembers": !members.is_empty(),
            "hasLeaders": !leaders.is_empty(),
            "members": members,
            "leaders": leaders,
        }),
    )
}

fn handle_groups_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group = match group_or_not_found(conn, req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let title = match optional_str(req, "title") {
        Some(t) if t.is_empty() => {
            return err(&req.id, "bad_params", "title must not be empty", None)
        }
        Some(t) => t,
        None => group.title.clone(),
    };
    let description = match req.params.get("description") {
        Some(v) if v.is_null() => None,
        Some(_) => optional_str(req, "description").filter(|d| !d.is_empty()),
        None => group.description.clone(),
    };

    if let Err(e) = conn.execute(
        "UPDATE groups SET title = ?, description = ? WHERE id = ?",
        (&title, &description, &group.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "groupId": group.id, "title": title, "description": description }),
    )
}

fn handle_groups_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group = match group_or_not_found(conn, req) {
        Ok(g) => g,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("group_members", "DELETE FROM group_members WHERE group_id = ?"),
        ("group_leaders", "DELETE FROM group_leaders WHERE group_id = ?"),
        ("groups", "DELETE FROM groups WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&group.id]) {
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
    tracing::info!(group = %group.name, "group deleted");
    ok(&req.id, json!({ "ok": true }))
}

#[derive(Clone, Copy)]
enum Relation {
    Members,
    Leaders,
}

impl Relation {
    fn table(self) -> &'static str {
        match self {
            Self::Members => "group_members",
            Self::Leaders => "group_leaders",
        }
    }
}

/// Adds or removes persons from one side of a group relationship. Ids that
/// are already in the requested state are skipped.
fn handle_relation_change(
    state: &mut AppState,
    req: &Request,
    relation: Relation,
    add: bool,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group = match group_or_not_found(conn, req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let person_ids = match required_str_list(req, "personIds") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut unknown = Vec::new();
    for pid in &person_ids {
        match persons::load_person(conn, pid) {
            Ok(Some(_)) => {}
            Ok(None) => unknown.push(pid.clone()),
            Err(e) => return query_failed(req, e),
        }
    }
    if !unknown.is_empty() {
        return err(
            &req.id,
            "not_found",
            "persons not found",
            Some(json!({ "personIds": unknown })),
        );
    }

    let sql = if add {
        format!(
            "INSERT OR IGNORE INTO {}(group_id, person_id) VALUES(?, ?)",
            relation.table()
        )
    } else {
        format!(
            "DELETE FROM {} WHERE group_id = ? AND person_id = ?",
            relation.table()
        )
    };
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut changed = 0usize;
    for pid in &person_ids {
        match tx.execute(&sql, (&group.id, pid)) {
            Ok(n) => changed += n,
            Err(e) => {
                let _ = tx.rollback();
                let code = if add {
                    "db_insert_failed"
                } else {
                    "db_delete_failed"
                };
                return err(
                    &req.id,
                    code,
                    e.to_string(),
                    Some(json!({ "table": relation.table() })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let key = if add { "added" } else { "removed" };
    ok(&req.id, json!({ key: changed }))
}

fn handle_groups_available(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group = match group_or_not_found(conn, req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let members = match persons::linked_persons(conn, "group_members", "group_id", &group.id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let all = match persons::list_persons(conn) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let available: Vec<_> = all
        .into_iter()
        .filter(|p| !members.iter().any(|m| m.id == p.id))
        .collect();
    ok(&req.id, json!({ "persons": available }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_groups_list(state, req)),
        "groups.create" => Some(handle_groups_create(state, req)),
        "groups.get" => Some(handle_groups_get(state, req)),
        "groups.update" => Some(handle_groups_update(state, req)),
        "groups.delete" => Some(handle_groups_delete(state, req)),
        "groups.members.add" => Some(handle_relation_change(state, req, Relation::Members, true)),
        "groups.members.remove" => {
            Some(handle_relation_change(state, req, Relation::Members, false))
        }
        "groups.leaders.add" => Some(handle_relation_change(state, req, Relation::Leaders, true)),
        "groups.leaders.remove" => {
            Some(handle_relation_change(state, req, Relation::Leaders, false))
        }
        "groups.available" => Some(handle_groups_available(state, req)),
        _ => None,
    }
}
