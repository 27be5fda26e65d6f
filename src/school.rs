//! Container lookups shared by the importer and the IPC handlers.
//!
//! Objects are addressed the way CSV files and the UI address them: by their
//! container key (`name`, or `username` for persons) within a scope.

use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

use crate::db;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolYear {
    pub id: String,
    pub name: String,
    pub title: String,
    pub first_date: String,
    pub last_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Term {
    pub id: String,
    pub school_year_id: String,
    pub name: String,
    pub title: String,
    pub first_date: String,
    pub last_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub name: String,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRef {
    pub id: String,
    pub username: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDay {
    pub id: String,
    pub periods: Vec<String>,
}

impl SchemaDay {
    pub fn has_period(&self, period_id: &str) -> bool {
        self.periods.iter().any(|p| p == period_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableSchema {
    pub id: String,
    pub name: String,
    pub title: String,
    pub days: Vec<SchemaDay>,
}

impl TimetableSchema {
    pub fn day(&self, day_id: &str) -> Option<&SchemaDay> {
        self.days.iter().find(|d| d.id == day_id)
    }
}

pub fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", raw))
}

pub fn create_school_year(
    conn: &Connection,
    title: &str,
    first_date: &str,
    last_date: &str,
) -> anyhow::Result<SchoolYear> {
    let first = parse_date(first_date)?;
    let last = parse_date(last_date)?;
    if last < first {
        bail!("school year ends before it starts");
    }
    let taken: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT name FROM school_years")?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        names
    };
    let year = SchoolYear {
        id: Uuid::new_v4().to_string(),
        name: db::choose_name(&taken, title),
        title: title.to_string(),
        first_date: first.to_string(),
        last_date: last.to_string(),
    };
    conn.execute(
        "INSERT INTO school_years(id, name, title, first_date, last_date) VALUES(?, ?, ?, ?, ?)",
        (
            &year.id,
            &year.name,
            &year.title,
            &year.first_date,
            &year.last_date,
        ),
    )?;
    Ok(year)
}

pub fn list_school_years(conn: &Connection) -> anyhow::Result<Vec<SchoolYear>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, title, first_date, last_date FROM school_years ORDER BY first_date",
    )?;
    let years = stmt
        .query_map([], |row| {
            Ok(SchoolYear {
                id: row.get(0)?,
                name: row.get(1)?,
                title: row.get(2)?,
                first_date: row.get(3)?,
                last_date: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(years)
}

pub fn load_school_year(conn: &Connection, id: &str) -> anyhow::Result<Option<SchoolYear>> {
    let year = conn
        .query_row(
            "SELECT id, name, title, first_date, last_date FROM school_years WHERE id = ?",
            [id],
            |row| {
                Ok(SchoolYear {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    title: row.get(2)?,
                    first_date: row.get(3)?,
                    last_date: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(year)
}

/// Adds a term to a school year. Terms must fit in the year and must not
/// overlap one another.
pub fn create_term(
    conn: &Connection,
    school_year_id: &str,
    title: &str,
    first_date: &str,
    last_date: &str,
) -> anyhow::Result<Term> {
    let year = load_school_year(conn, school_year_id)?
        .ok_or_else(|| anyhow!("school year not found"))?;
    let first = parse_date(first_date)?;
    let last = parse_date(last_date)?;
    if last < first {
        bail!("term ends before it starts");
    }
    if first < parse_date(&year.first_date)? || last > parse_date(&year.last_date)? {
        bail!("term must lie within school year {}", year.title);
    }
    for other in list_terms(conn, school_year_id)? {
        let o_first = parse_date(&other.first_date)?;
        let o_last = parse_date(&other.last_date)?;
        if first <= o_last && o_first <= last {
            bail!("term overlaps {}", other.title);
        }
    }

    let taken = db::taken_names(conn, "terms", "school_year_id", school_year_id)?;
    let term = Term {
        id: Uuid::new_v4().to_string(),
        school_year_id: school_year_id.to_string(),
        name: db::choose_name(&taken, title),
        title: title.to_string(),
        first_date: first.to_string(),
        last_date: last.to_string(),
    };
    conn.execute(
        "INSERT INTO terms(id, school_year_id, name, title, first_date, last_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &term.id,
            &term.school_year_id,
            &term.name,
            &term.title,
            &term.first_date,
            &term.last_date,
        ),
    )?;
    Ok(term)
}

pub fn list_terms(conn: &Connection, school_year_id: &str) -> anyhow::Result<Vec<Term>> {
    let mut stmt = conn.prepare(
        "SELECT id, school_year_id, name, title, first_date, last_date
         FROM terms WHERE school_year_id = ? ORDER BY first_date",
    )?;
    let terms = stmt
        .query_map([school_year_id], map_term)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(terms)
}

pub fn load_term(conn: &Connection, term_id: &str) -> anyhow::Result<Option<Term>> {
    let term = conn
        .query_row(
            "SELECT id, school_year_id, name, title, first_date, last_date
             FROM terms WHERE id = ?",
            [term_id],
            map_term,
        )
        .optional()?;
    Ok(term)
}

fn map_term(row: &rusqlite::Row<'_>) -> rusqlite::Result<Term> {
    Ok(Term {
        id: row.get(0)?,
        school_year_id: row.get(1)?,
        name: row.get(2)?,
        title: row.get(3)?,
        first_date: row.get(4)?,
        last_date: row.get(5)?,
    })
}

pub fn create_course(
    conn: &Connection,
    school_year_id: &str,
    name: Option<&str>,
    title: &str,
    description: Option<&str>,
) -> anyhow::Result<Course> {
    let taken = db::taken_names(conn, "courses", "school_year_id", school_year_id)?;
    let name = match name {
        Some(n) => {
            if taken.contains(n) {
                bail!("course {} already exists", n);
            }
            n.to_string()
        }
        None => db::choose_name(&taken, title),
    };
    let course = Course {
        id: Uuid::new_v4().to_string(),
        name,
        title: title.to_string(),
        description: description.map(|s| s.to_string()),
    };
    conn.execute(
        "INSERT INTO courses(id, school_year_id, name, title, description) VALUES(?, ?, ?, ?, ?)",
        (
            &course.id,
            school_year_id,
            &course.name,
            &course.title,
            &course.description,
        ),
    )?;
    Ok(course)
}

pub fn list_courses(conn: &Connection, school_year_id: &str) -> anyhow::Result<Vec<Course>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, title, description FROM courses WHERE school_year_id = ? ORDER BY title",
    )?;
    let courses = stmt
        .query_map([school_year_id], map_course)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(courses)
}

pub fn find_course(
    conn: &Connection,
    school_year_id: &str,
    name: &str,
) -> anyhow::Result<Option<Course>> {
    let course = conn
        .query_row(
            "SELECT id, name, title, description FROM courses WHERE school_year_id = ? AND name = ?",
            [school_year_id, name],
            map_course,
        )
        .optional()?;
    Ok(course)
}

fn map_course(row: &rusqlite::Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        name: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
    })
}

pub fn find_person(conn: &Connection, username: &str) -> anyhow::Result<Option<PersonRef>> {
    let person = conn
        .query_row(
            "SELECT id, username, title FROM persons WHERE username = ?",
            [username],
            |row| {
                Ok(PersonRef {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    title: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(person)
}

/// Creates a timetable schema with its days and periods, in the given order.
pub fn create_schema(
    conn: &Connection,
    school_year_id: &str,
    name: &str,
    title: &str,
    days: &[SchemaDay],
) -> anyhow::Result<TimetableSchema> {
    if days.is_empty() {
        bail!("a timetable schema needs at least one day");
    }
    for (i, day) in days.iter().enumerate() {
        if day.id.trim().is_empty() {
            bail!("day ids must not be empty");
        }
        if days[..i].iter().any(|d| d.id == day.id) {
            bail!("duplicate day id {}", day.id);
        }
    }
    if find_schema_id(conn, school_year_id, name)?.is_some() {
        bail!("timetable schema {} already exists", name);
    }

    let schema = TimetableSchema {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        title: title.to_string(),
        days: days.to_vec(),
    };
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO timetable_schemas(id, school_year_id, name, title) VALUES(?, ?, ?, ?)",
        (&schema.id, school_year_id, &schema.name, &schema.title),
    )?;
    for (day_order, day) in schema.days.iter().enumerate() {
        tx.execute(
            "INSERT INTO schema_days(schema_id, day_id, sort_order) VALUES(?, ?, ?)",
            (&schema.id, &day.id, day_order as i64),
        )?;
        for (period_order, period) in day.periods.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO schema_periods(schema_id, day_id, period_id, sort_order)
                 VALUES(?, ?, ?, ?)",
                (&schema.id, &day.id, period, period_order as i64),
            )?;
        }
    }
    tx.commit()?;
    Ok(schema)
}

fn find_schema_id(
    conn: &Connection,
    school_year_id: &str,
    name: &str,
) -> anyhow::Result<Option<(String, String)>> {
    let v = conn
        .query_row(
            "SELECT id, title FROM timetable_schemas WHERE school_year_id = ? AND name = ?",
            [school_year_id, name],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(v)
}

pub fn load_schema(
    conn: &Connection,
    school_year_id: &str,
    name: &str,
) -> anyhow::Result<Option<TimetableSchema>> {
    let Some((id, title)) = find_schema_id(conn, school_year_id, name)? else {
        return Ok(None);
    };

    let mut day_stmt =
        conn.prepare("SELECT day_id FROM schema_days WHERE schema_id = ? ORDER BY sort_order")?;
    let day_ids = day_stmt
        .query_map([&id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut period_stmt = conn.prepare(
        "SELECT period_id FROM schema_periods
         WHERE schema_id = ? AND day_id = ?
         ORDER BY sort_order",
    )?;
    let mut days = Vec::with_capacity(day_ids.len());
    for day_id in day_ids {
        let periods = period_stmt
            .query_map([&id, &day_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        days.push(SchemaDay {
            id: day_id,
            periods,
        });
    }

    Ok(Some(TimetableSchema {
        id,
        name: name.to_string(),
        title,
        days,
    }))
}

pub fn list_schema_names(conn: &Connection, school_year_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM timetable_schemas WHERE school_year_id = ? ORDER BY name")?;
    let names = stmt
        .query_map([school_year_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// First section of the term carrying exactly this title.
pub fn find_section_by_title(
    conn: &Connection,
    term_id: &str,
    title: &str,
) -> anyhow::Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM sections WHERE term_id = ? AND title = ? ORDER BY rowid LIMIT 1",
            [term_id, title],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

pub fn create_section(
    conn: &Connection,
    term_id: &str,
    title: &str,
    description: Option<&str>,
) -> anyhow::Result<(String, String)> {
    let taken = db::taken_names(conn, "sections", "term_id", term_id)?;
    let name = db::choose_name(&taken, "");
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, term_id, name, title, description) VALUES(?, ?, ?, ?, ?)",
        (&id, term_id, &name, title, description),
    )?;
    Ok((id, name))
}
