use anyhow::{bail, Context};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub title: String,
    pub has_password: bool,
    pub has_photo: bool,
}

impl Person {
    /// Sort order used by every person listing: last name, then first name.
    pub fn sort_key(&self) -> (String, String) {
        (self.last_name.to_lowercase(), self.first_name.to_lowercase())
    }
}

pub struct NewPerson<'a> {
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub title: Option<&'a str>,
}

const PERSON_COLUMNS: &str = "id, username, first_name, last_name, title,
    password_hash IS NOT NULL, photo IS NOT NULL";

fn map_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        title: row.get(4)?,
        has_password: row.get(5)?,
        has_photo: row.get(6)?,
    })
}

pub fn display_title(first_name: &str, last_name: &str) -> String {
    format!("{} {}", first_name.trim(), last_name.trim())
        .trim()
        .to_string()
}

/// Creates a person together with its bound contact record.
pub fn create_person(conn: &Connection, new: &NewPerson<'_>) -> anyhow::Result<Person> {
    let username = new.username.trim();
    if username.is_empty() {
        bail!("username must not be empty");
    }
    let title = match new.title.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => display_title(new.first_name, new.last_name),
    };
    let id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO persons(id, username, first_name, last_name, title) VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            username,
            new.first_name.trim(),
            new.last_name.trim(),
            &title,
        ),
    )
    .with_context(|| format!("failed to insert person {}", username))?;
    tx.execute(
        "INSERT INTO contacts(id, person_id, first_name, last_name, form_key) VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &id,
            new.first_name.trim(),
            new.last_name.trim(),
            username,
        ),
    )?;
    tx.commit()?;

    load_person(conn, &id)?.context("person vanished after insert")
}

pub fn load_person(conn: &Connection, id: &str) -> anyhow::Result<Option<Person>> {
    let sql = format!("SELECT {} FROM persons WHERE id = ?", PERSON_COLUMNS);
    let person = conn.query_row(&sql, [id], map_person).optional()?;
    Ok(person)
}

pub fn list_persons(conn: &Connection) -> anyhow::Result<Vec<Person>> {
    let sql = format!("SELECT {} FROM persons", PERSON_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut persons = stmt
        .query_map([], map_person)?
        .collect::<Result<Vec<_>, _>>()?;
    sort_persons(&mut persons);
    Ok(persons)
}

/// Persons whose ids appear in the `person_id` column of a link table row
/// scoped by `scope_column = scope_id`.
pub fn linked_persons(
    conn: &Connection,
    link_table: &str,
    scope_column: &str,
    scope_id: &str,
) -> anyhow::Result<Vec<Person>> {
    let sql = format!(
        "SELECT {} FROM persons
         WHERE id IN (SELECT person_id FROM {} WHERE {} = ?)",
        PERSON_COLUMNS, link_table, scope_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut persons = stmt
        .query_map([scope_id], map_person)?
        .collect::<Result<Vec<_>, _>>()?;
    sort_persons(&mut persons);
    Ok(persons)
}

pub fn sort_persons(persons: &mut [Person]) {
    persons.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.username.cmp(&b.username))
    });
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stores a salted hash of `password`. `None` removes the password, which
/// disables the account until a new one is set.
pub fn set_password(conn: &Connection, id: &str, password: Option<&str>) -> anyhow::Result<bool> {
    let changed = match password {
        Some(pw) => {
            let salt = Uuid::new_v4().simple().to_string();
            conn.execute(
                "UPDATE persons SET password_hash = ?, password_salt = ? WHERE id = ?",
                (hash_password(&salt, pw), &salt, id),
            )?
        }
        None => conn.execute(
            "UPDATE persons SET password_hash = NULL, password_salt = NULL WHERE id = ?",
            [id],
        )?,
    };
    Ok(changed > 0)
}

pub fn check_password(conn: &Connection, id: &str, password: &str) -> anyhow::Result<bool> {
    let stored: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT password_hash, password_salt FROM persons WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match stored {
        Some((Some(hash), Some(salt))) => Ok(hash_password(&salt, password) == hash),
        _ => Ok(false),
    }
}

pub const TIME_FORMATS: [&str; 2] = ["%H:%M", "%I:%M %p"];
pub const DATE_FORMATS: [&str; 3] = ["%m/%d/%y", "%Y-%m-%d", "%d %B, %Y"];

/// Week start days use the calendar numbering where Monday is 0.
pub const WEEK_STARTS: [(&str, i64); 3] = [("saturday", 5), ("sunday", 6), ("monday", 0)];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub timezone: String,
    pub time_format: String,
    pub date_format: String,
    pub week_start: i64,
    pub cal_periods: bool,
    pub cal_public: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            time_format: TIME_FORMATS[0].to_string(),
            date_format: DATE_FORMATS[1].to_string(),
            week_start: 0,
            cal_periods: true,
            cal_public: false,
        }
    }
}

impl Preferences {
    pub fn validate(&self) -> Result<(), String> {
        if self.timezone.trim().is_empty() {
            return Err("timezone must not be empty".into());
        }
        if !TIME_FORMATS.contains(&self.time_format.as_str()) {
            return Err(format!("timeFormat must be one of: {}", TIME_FORMATS.join(", ")));
        }
        if !DATE_FORMATS.contains(&self.date_format.as_str()) {
            return Err(format!("dateFormat must be one of: {}", DATE_FORMATS.join(", ")));
        }
        if !WEEK_STARTS.iter().any(|(_, n)| *n == self.week_start) {
            return Err("weekStart must be one of: 5 (saturday), 6 (sunday), 0 (monday)".into());
        }
        Ok(())
    }
}

pub fn week_start_from_name(name: &str) -> Option<i64> {
    WEEK_STARTS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(_, v)| *v)
}

pub fn get_preferences(conn: &Connection, person_id: &str) -> anyhow::Result<Option<Preferences>> {
    let prefs = conn
        .query_row(
            "SELECT timezone, time_format, date_format, week_start, cal_periods, cal_public
             FROM person_preferences WHERE person_id = ?",
            [person_id],
            |r| {
                Ok(Preferences {
                    timezone: r.get(0)?,
                    time_format: r.get(1)?,
                    date_format: r.get(2)?,
                    week_start: r.get(3)?,
                    cal_periods: r.get(4)?,
                    cal_public: r.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(prefs)
}

pub fn set_preferences(
    conn: &Connection,
    person_id: &str,
    prefs: &Preferences,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO person_preferences(person_id, timezone, time_format, date_format, week_start, cal_periods, cal_public)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(person_id) DO UPDATE SET
           timezone = excluded.timezone,
           time_format = excluded.time_format,
           date_format = excluded.date_format,
           week_start = excluded.week_start,
           cal_periods = excluded.cal_periods,
           cal_public = excluded.cal_public",
        (
            person_id,
            &prefs.timezone,
            &prefs.time_format,
            &prefs.date_format,
            prefs.week_start,
            prefs.cal_periods,
            prefs.cal_public,
        ),
    )?;
    Ok(())
}
