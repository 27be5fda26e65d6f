use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

use crate::generations;

pub const DB_FILE_NAME: &str = "schooltool.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    let generation = generations::evolve(&conn)?;
    tracing::info!(
        workspace = %workspace.display(),
        generation,
        "workspace database ready"
    );
    Ok(conn)
}

/// Creates every table the daemon needs. Safe to run on an existing workspace.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            title TEXT NOT NULL,
            password_hash TEXT,
            password_salt TEXT,
            photo BLOB
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS person_preferences(
            person_id TEXT PRIMARY KEY,
            timezone TEXT NOT NULL,
            time_format TEXT NOT NULL,
            date_format TEXT NOT NULL,
            week_start INTEGER NOT NULL,
            cal_periods INTEGER NOT NULL,
            cal_public INTEGER NOT NULL,
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            first_date TEXT NOT NULL,
            last_date TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            first_date TEXT NOT NULL,
            last_date TEXT NOT NULL,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            UNIQUE(school_year_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_school_year ON terms(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            UNIQUE(school_year_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(term_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_term ON sections(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_courses(
            section_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            PRIMARY KEY(section_id, course_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_instructors(
            section_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(section_id, person_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_members(
            section_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(section_id, person_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_section_members_person ON section_members(person_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_schemas(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            UNIQUE(school_year_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_days(
            schema_id TEXT NOT NULL,
            day_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(schema_id, day_id),
            FOREIGN KEY(schema_id) REFERENCES timetable_schemas(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_periods(
            schema_id TEXT NOT NULL,
            day_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(schema_id, day_id, period_id),
            FOREIGN KEY(schema_id, day_id) REFERENCES schema_days(schema_id, day_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term_id TEXT NOT NULL,
            schema_id TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(schema_id) REFERENCES timetable_schemas(id),
            UNIQUE(section_id, name),
            UNIQUE(section_id, term_id, schema_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_activities(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            day_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            title TEXT NOT NULL,
            owner_section_id TEXT NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            FOREIGN KEY(owner_section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_activities_tt ON timetable_activities(timetable_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            UNIQUE(school_year_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(group_id, person_id),
            FOREIGN KEY(group_id) REFERENCES groups(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_leaders(
            group_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(group_id, person_id),
            FOREIGN KEY(group_id) REFERENCES groups(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_members_person ON group_members(person_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS generations(
            key TEXT PRIMARY KEY,
            generation INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Picks a container key that is not in `taken`.
///
/// An empty hint yields the smallest unused positive integer. Otherwise the
/// hint is normalised and suffixed with `-2`, `-3`, ... until it is free.
pub fn choose_name(taken: &HashSet<String>, hint: &str) -> String {
    let base = normalize_name(hint);
    if base.is_empty() {
        let mut n: u64 = 1;
        loop {
            let candidate = n.to_string();
            if !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
    if !taken.contains(&base) {
        return base;
    }
    let mut n: u64 = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn normalize_name(hint: &str) -> String {
    let lowered = hint.trim().to_lowercase();
    let stripped = lowered.trim_start_matches(['+', '@']);
    stripped
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '-' } else { c })
        .collect()
}

/// Names already used in one container, e.g. the sections of a term.
pub fn taken_names(
    conn: &Connection,
    table: &str,
    scope_column: &str,
    scope_id: &str,
) -> anyhow::Result<HashSet<String>> {
    let sql = format!("SELECT name FROM {} WHERE {} = ?", table, scope_column);
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([scope_id], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute("PRAGMA foreign_keys = ON", [])
        .expect("enable foreign keys");
    init_schema(&conn).expect("init schema");
    generations::evolve(&conn).expect("evolve");
    conn
}
