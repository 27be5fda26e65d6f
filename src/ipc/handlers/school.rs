use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::persons;
use crate::school::{self, SchemaDay};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn handle_schoolyears_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first = match required_str(req, "firstDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last = match required_str(req, "lastDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::create_school_year(conn, &title, &first, &last) {
        Ok(year) => ok(&req.id, json!({ "schoolYear": year })),
        Err(e) => err(&req.id, "bad_params", e.to_string(), None),
    }
}

fn handle_schoolyears_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match school::list_school_years(conn) {
        Ok(years) => ok(&req.id, json!({ "schoolYears": years })),
        Err(e) => query_failed(req, e),
    }
}

fn require_school_year(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    let id = required_str(req, "schoolYearId")?;
    match school::load_school_year(conn, &id) {
        Ok(Some(_)) => Ok(id),
        Ok(None) => Err(err(&req.id, "not_found", "school year not found", None)),
        Err(e) => Err(query_failed(req, e)),
    }
}

fn require_term(conn: &Connection, req: &Request) -> Result<school::Term, serde_json::Value> {
    let id = required_str(req, "termId")?;
    match school::load_term(conn, &id) {
        Ok(Some(t)) => Ok(t),
        Ok(None) => Err(err(&req.id, "not_found", "term not found", None)),
        Err(e) => Err(query_failed(req, e)),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first = match required_str(req, "firstDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last = match required_str(req, "lastDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::create_term(conn, &school_year_id, &title, &first, &last) {
        Ok(term) => ok(&req.id, json!({ "term": term })),
        Err(e) => err(&req.id, "bad_params", e.to_string(), None),
    }
}

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::list_terms(conn, &school_year_id) {
        Ok(terms) => ok(&req.id, json!({ "terms": terms })),
        Err(e) => query_failed(req, e),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = optional_str(req, "name").filter(|n| !n.is_empty());
    let description = optional_str(req, "description").filter(|d| !d.is_empty());
    match school::create_course(
        conn,
        &school_year_id,
        name.as_deref(),
        &title,
        description.as_deref(),
    ) {
        Ok(course) => ok(&req.id, json!({ "course": course })),
        Err(e) => err(&req.id, "conflict", e.to_string(), None),
    }
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::list_courses(conn, &school_year_id) {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => query_failed(req, e),
    }
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let term = match require_term(conn, req) {
        Ok(t) => t,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.title,
           s.description,
           (SELECT COUNT(*) FROM section_members sm WHERE sm.section_id = s.id) AS member_count,
           (SELECT COUNT(*) FROM timetables t WHERE t.section_id = s.id) AS timetable_count
         FROM sections s
         WHERE s.term_id = ?
         ORDER BY s.title, s.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return query_failed(req, e),
    };
    let rows = stmt
        .query_map([&term.id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "description": row.get::<_, Option<String>>(3)?,
                "memberCount": row.get::<_, i64>(4)?,
                "timetableCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => query_failed(req, e),
    }
}

fn section_courses(conn: &Connection, section_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT c.name, c.title FROM section_courses sc
         JOIN courses c ON c.id = sc.course_id
         WHERE sc.section_id = ?
         ORDER BY c.title",
    )?;
    let courses = stmt
        .query_map([section_id], |r| {
            Ok(json!({ "name": r.get::<_, String>(0)?, "title": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(courses)
}

fn section_timetables(conn: &Connection, section_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut tt_stmt = conn.prepare(
        "SELECT t.id, t.name, ts.name
         FROM timetables t
         JOIN timetable_schemas ts ON ts.id = t.schema_id
         WHERE t.section_id = ?
         ORDER BY t.name",
    )?;
    let timetables = tt_stmt
        .query_map([section_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut act_stmt = conn.prepare(
        "SELECT a.day_id, a.period_id, a.title
         FROM timetable_activities a
         LEFT JOIN schema_days d ON d.day_id = a.day_id
           AND d.schema_id = (SELECT schema_id FROM timetables WHERE id = a.timetable_id)
         WHERE a.timetable_id = ?
         ORDER BY d.sort_order, a.period_id",
    )?;
    let mut out = Vec::with_capacity(timetables.len());
    for (id, name, schema) in timetables {
        let activities = act_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "dayId": r.get::<_, String>(0)?,
                    "periodId": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(json!({
            "id": id,
            "name": name,
            "schema": schema,
            "activities": activities,
        }));
    }
    Ok(out)
}

fn handle_sections_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section = match conn
        .query_row(
            "SELECT id, term_id, name, title, description FROM sections WHERE id = ?",
            [&section_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "termId": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "title": r.get::<_, String>(3)?,
                    "description": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()
    {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return query_failed(req, e),
    };

    let courses = match section_courses(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let instructors =
        match persons::linked_persons(conn, "section_instructors", "section_id", &section_id) {
            Ok(v) => v,
            Err(e) => return query_failed(req, e),
        };
    let members = match persons::linked_persons(conn, "section_members", "section_id", &section_id)
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let timetables = match section_timetables(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };

    ok(
        &req.id,
        json!({
            "section": section,
            "courses": courses,
            "instructors": instructors,
            "members": members,
            "timetables": timetables,
        }),
    )
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let term = match require_term(conn, req) {
        Ok(t) => t,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = optional_str(req, "description").filter(|d| !d.is_empty());
    match school::create_section(conn, &term.id, &title, description.as_deref()) {
        Ok((id, name)) => ok(
            &req.id,
            json!({ "sectionId": id, "name": name, "title": title }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        ),
    }
}

fn parse_days(req: &Request) -> Result<Vec<SchemaDay>, serde_json::Value> {
    let bad = || {
        err(
            &req.id,
            "bad_params",
            "days must be an array of { id, periods: [string] }",
            None,
        )
    };
    let Some(arr) = req.params.get("days").and_then(|v| v.as_array()) else {
        return Err(bad());
    };
    let mut days = Vec::with_capacity(arr.len());
    for d in arr {
        let Some(id) = d.get("id").and_then(|v| v.as_str()) else {
            return Err(bad());
        };
        let Some(periods) = d.get("periods").and_then(|v| v.as_array()) else {
            return Err(bad());
        };
        let periods = periods
            .iter()
            .map(|p| p.as_str().map(|s| s.trim().to_string()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(bad)?;
        days.push(SchemaDay {
            id: id.trim().to_string(),
            periods,
        });
    }
    Ok(days)
}

fn handle_schemas_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = optional_str(req, "title")
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| name.clone());
    let days = match parse_days(req) {
        Ok(d) => d,
        Err(e) => return e,
    };
    match school::create_schema(conn, &school_year_id, &name, &title, &days) {
        Ok(schema) => ok(&req.id, json!({ "schema": schema })),
        Err(e) => err(&req.id, "bad_params", e.to_string(), None),
    }
}

fn handle_schemas_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::list_schema_names(conn, &school_year_id) {
        Ok(names) => ok(&req.id, json!({ "schemas": names })),
        Err(e) => query_failed(req, e),
    }
}

fn handle_schemas_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_year_id = match require_school_year(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match school::load_schema(conn, &school_year_id, &name) {
        Ok(Some(schema)) => ok(&req.id, json!({ "schema": schema })),
        Ok(None) => err(&req.id, "not_found", "timetable schema not found", None),
        Err(e) => query_failed(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schoolyears.create" => Some(handle_schoolyears_create(state, req)),
        "schoolyears.list" => Some(handle_schoolyears_list(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.list" => Some(handle_terms_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        "sections.get" => Some(handle_sections_get(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "schemas.create" => Some(handle_schemas_create(state, req)),
        "schemas.list" => Some(handle_schemas_list(state, req)),
        "schemas.get" => Some(handle_schemas_get(state, req)),
        _ => None,
    }
}
