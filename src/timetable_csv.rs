//! Timetable CSV import.
//!
//! The file starts with a header row naming the timetable schema, then an
//! empty row, then blank-line separated chunks, one per section:
//!
//! ```text
//! course_id, instructor_id
//! day_id, period_id
//! day_id, period_id
//! ***
//! student_id
//! student_id
//! ```
//!
//! Problems are collected rather than raised so that a user sees every
//! mistake in the file at once. The whole file is validated in a dry run
//! before anything is written.

use encoding_rs::Encoding;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db;
use crate::school::{self, Course, PersonRef, Term, TimetableSchema};

pub const SECTION_SENTINEL: &str = "***";

pub type Row = Vec<String>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("timetable CSV data is invalid")]
    Invalid,
    #[error("errors appeared while committing timetable CSV data, transaction aborted")]
    Fatal,
    #[error("unknown charset: {0}")]
    UnknownCharset(String),
    #[error("term not found: {0}")]
    TermNotFound(String),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ImportError {
    fn from(e: rusqlite::Error) -> Self {
        ImportError::Db(e.into())
    }
}

/// Errors gathered during an import, grouped by kind.
///
/// `generic` holds ready-made messages; every other list holds offending
/// identifiers, each recorded at most once.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCollection {
    pub generic: Vec<String>,
    pub day_ids: Vec<String>,
    pub periods: Vec<String>,
    pub persons: Vec<String>,
    pub courses: Vec<String>,
    pub sections: Vec<String>,
    pub records: Vec<String>,
}

impl ErrorCollection {
    pub fn any_errors(&self) -> bool {
        !(self.generic.is_empty()
            && self.day_ids.is_empty()
            && self.periods.is_empty()
            && self.persons.is_empty()
            && self.courses.is_empty()
            && self.sections.is_empty()
            && self.records.is_empty())
    }
}

fn push_unique(list: &mut Vec<String>, token: &str) {
    if !list.iter().any(|t| t == token) {
        list.push(token.to_string());
    }
}

/// User-facing messages: generic messages first, then one line per
/// non-empty category.
pub fn present_errors(errors: &ErrorCollection) -> Vec<String> {
    let mut out = errors.generic.clone();
    let categories: [(&Vec<String>, &str); 6] = [
        (&errors.day_ids, "Day ids not defined in selected schema"),
        (&errors.periods, "Periods not defined in selected days"),
        (&errors.persons, "Persons not found"),
        (&errors.courses, "Courses not found"),
        (&errors.sections, "Sections not found"),
        (&errors.records, "Invalid records"),
    ];
    for (tokens, label) in categories {
        if !tokens.is_empty() {
            out.push(format!("{}: {}.", label, tokens.join(", ")));
        }
    }
    out
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub sections_created: Vec<String>,
    pub sections_reused: Vec<String>,
    pub timetables_created: usize,
    pub activities_added: usize,
    pub members_enrolled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    DryRun,
    Commit,
}

/// One section description and the 1-based file line of its first row.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub line: usize,
    pub rows: &'a [Row],
}

/// Splits the rows after the header at empty rows.
///
/// `rows` starts at file line 3, which is where chunk line numbers come from.
pub fn split_chunks(rows: &[Row]) -> Vec<Chunk<'_>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (i, row) in rows.iter().enumerate() {
        if row.is_empty() {
            if !rows[start].is_empty() {
                chunks.push(Chunk {
                    line: start + 3,
                    rows: &rows[start..i],
                });
            }
            start = i + 1;
        }
    }
    if rows.last().is_some_and(|r| !r.is_empty()) {
        chunks.push(Chunk {
            line: start + 3,
            rows: &rows[start..],
        });
    }
    chunks
}

/// Splits on `\n`, `\r\n` and `\r`. A trailing line break does not produce
/// a final empty line.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\n' => {
                lines.push(&data[start..i]);
                start = i + 1;
            }
            b'\r' => {
                lines.push(&data[start..i]);
                if data.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < data.len() {
        lines.push(&data[start..]);
    }
    lines
}

enum LineError {
    Syntax,
    Decode,
}

/// True when a field that opens with `"` is still open at the end of the
/// line. Quotes inside unquoted fields are literal.
fn has_open_quote(line: &[u8]) -> bool {
    let mut in_quotes = false;
    let mut field_start = true;
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if in_quotes {
            if b == b'"' {
                if line.get(i + 1) == Some(&b'"') {
                    i += 1;
                } else {
                    in_quotes = false;
                }
            }
        } else if b == b',' {
            field_start = true;
            i += 1;
            continue;
        } else if b == b'"' && field_start {
            in_quotes = true;
        }
        field_start = false;
        i += 1;
    }
    in_quotes
}

fn parse_line(line: &[u8], charset: Option<&'static Encoding>) -> Result<Row, LineError> {
    if has_open_quote(line) {
        return Err(LineError::Syntax);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    let mut record = csv::ByteRecord::new();
    match reader.read_byte_record(&mut record) {
        Ok(true) => {}
        Ok(false) => return Ok(Vec::new()),
        Err(_) => return Err(LineError::Syntax),
    }

    let mut values = Vec::with_capacity(record.len());
    for raw in record.iter() {
        let decoded = match charset {
            Some(enc) => enc
                .decode_without_bom_handling_and_without_replacement(raw)
                .map(|s| s.into_owned()),
            None => std::str::from_utf8(raw).ok().map(str::to_owned),
        };
        let Some(value) = decoded else {
            return Err(LineError::Decode);
        };
        values.push(value.trim().to_string());
    }
    while values.last().is_some_and(|v| v.is_empty()) {
        values.pop();
    }
    Ok(values)
}

pub fn resolve_charset(label: &str) -> Result<&'static Encoding, ImportError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ImportError::UnknownCharset(label.to_string()))
}

/// Imports timetable CSV data into the sections of one term.
pub struct TimetableCsvImporter<'c> {
    conn: &'c Connection,
    term: Term,
    charset: Option<&'static Encoding>,
    schema: Option<TimetableSchema>,
    errors: ErrorCollection,
    summary: ImportSummary,
    aborted: Option<String>,
}

impl<'c> TimetableCsvImporter<'c> {
    pub fn new(
        conn: &'c Connection,
        term_id: &str,
        charset: Option<&str>,
    ) -> Result<Self, ImportError> {
        let term = school::load_term(conn, term_id)?
            .ok_or_else(|| ImportError::TermNotFound(term_id.to_string()))?;
        let charset = match charset {
            Some(label) => Some(resolve_charset(label)?),
            None => None,
        };
        Ok(Self {
            conn,
            term,
            charset,
            schema: None,
            errors: ErrorCollection::default(),
            summary: ImportSummary::default(),
            aborted: None,
        })
    }

    pub fn errors(&self) -> &ErrorCollection {
        &self.errors
    }

    pub fn summary(&self) -> &ImportSummary {
        &self.summary
    }

    /// Why the last `import_from_csv` failed, when the cause was not invalid
    /// data (a rolled back commit or a storage error).
    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    /// Returns true when the data was imported, false when it was rejected.
    /// Rejection reasons are left in `errors()`.
    pub fn import_from_csv(&mut self, data: &[u8]) -> bool {
        self.aborted = None;
        match self.import_sections(data) {
            Ok(_) => true,
            Err(ImportError::Invalid) => false,
            Err(e) => {
                tracing::error!(error = %e, term = %self.term.name, "timetable import aborted");
                self.aborted = Some(e.to_string());
                false
            }
        }
    }

    /// Validates everything, then commits in one transaction.
    pub fn import_sections(&mut self, data: &[u8]) -> Result<ImportSummary, ImportError> {
        let rows = self.prepare(data)?;
        let body = rows.get(2..).unwrap_or(&[]);

        self.import_chunks(body, Pass::DryRun)?;
        if self.errors.any_errors() {
            tracing::info!(
                term = %self.term.name,
                errors = ?self.errors,
                "timetable import rejected by dry run"
            );
            return Err(ImportError::Invalid);
        }

        let conn = self.conn;
        let tx = conn.unchecked_transaction()?;
        if let Err(e) = self.import_chunks(body, Pass::Commit) {
            let _ = tx.rollback();
            return Err(e);
        }
        if self.errors.any_errors() {
            let _ = tx.rollback();
            tracing::error!(
                term = %self.term.name,
                errors = ?self.errors,
                "commit pass produced errors after a clean dry run"
            );
            return Err(ImportError::Fatal);
        }
        tx.commit()?;

        tracing::info!(
            term = %self.term.name,
            created = self.summary.sections_created.len(),
            reused = self.summary.sections_reused.len(),
            activities = self.summary.activities_added,
            members = self.summary.members_enrolled,
            "timetable import committed"
        );
        Ok(self.summary.clone())
    }

    /// Runs every check without writing anything.
    pub fn validate(&mut self, data: &[u8]) -> Result<(), ImportError> {
        let rows = self.prepare(data)?;
        self.import_chunks(rows.get(2..).unwrap_or(&[]), Pass::DryRun)?;
        if self.errors.any_errors() {
            return Err(ImportError::Invalid);
        }
        Ok(())
    }

    /// Parses the rows and checks the two header rows.
    fn prepare(&mut self, data: &[u8]) -> Result<Vec<Row>, ImportError> {
        if !data.contains(&b'\n') {
            self.errors.generic.push("No data provided".to_string());
            return Err(ImportError::Invalid);
        }

        let rows = self.parse_csv_rows(data)?;
        tracing::debug!(rows = rows.len(), "parsed timetable CSV rows");

        if rows.get(1).is_some_and(|r| !r.is_empty()) {
            self.errors.generic.push("Row 2 is not empty".to_string());
            return Err(ImportError::Invalid);
        }

        // Data has a line break, so there is at least one row.
        self.import_header(&rows[0])?;
        if self.errors.any_errors() {
            return Err(ImportError::Invalid);
        }
        Ok(rows)
    }

    /// Returns the rows of `data` as trimmed fields, without trailing empty
    /// cells. Fails on bad quoting or on text that does not decode.
    pub fn parse_csv_rows(&mut self, data: &[u8]) -> Result<Vec<Row>, ImportError> {
        let mut rows = Vec::new();
        for (i, line) in split_lines(data).into_iter().enumerate() {
            let line_no = i + 1;
            match parse_line(line, self.charset) {
                Ok(row) => rows.push(row),
                Err(LineError::Syntax) => {
                    self.errors
                        .generic
                        .push(format!("Error in timetable CSV data, line {}", line_no));
                    return Err(ImportError::Invalid);
                }
                Err(LineError::Decode) => {
                    self.errors
                        .generic
                        .push(format!("Conversion to unicode failed in line {}", line_no));
                    return Err(ImportError::Invalid);
                }
            }
        }
        Ok(rows)
    }

    fn import_header(&mut self, row: &Row) -> Result<(), ImportError> {
        if row.len() != 1 {
            self.errors.generic.push(
                "The first row of the CSV file must contain the timetable schema id.".to_string(),
            );
            return Ok(());
        }
        let schema_id = &row[0];
        match school::load_schema(self.conn, &self.term.school_year_id, schema_id)? {
            Some(schema) => self.schema = Some(schema),
            None => self.errors.generic.push(format!(
                "The timetable schema {} does not exist.",
                schema_id
            )),
        }
        Ok(())
    }

    fn import_chunks(&mut self, rows: &[Row], pass: Pass) -> Result<(), ImportError> {
        for chunk in split_chunks(rows) {
            self.import_chunk(&chunk, pass)?;
        }
        Ok(())
    }

    fn import_chunk(&mut self, chunk: &Chunk<'_>, pass: Pass) -> Result<(), ImportError> {
        let header = &chunk.rows[0];
        if header.len() != 2 {
            self.errors.generic.push(format!(
                "Wrong section header on line {} (it should contain a course id and an instructor id)",
                chunk.line
            ));
            return Ok(());
        }
        let (course_id, instructor_id) = (&header[0], &header[1]);

        let course = school::find_course(self.conn, &self.term.school_year_id, course_id)?;
        if course.is_none() {
            push_unique(&mut self.errors.courses, course_id);
        }
        let instructor = school::find_person(self.conn, instructor_id)?;
        if instructor.is_none() {
            push_unique(&mut self.errors.persons, instructor_id);
        }

        let Some(schema) = self.schema.as_ref() else {
            return Err(anyhow::anyhow!("chunk imported before the header").into());
        };

        let mut line_ofs = 1;
        let mut periods: Vec<(String, String)> = Vec::new();
        let mut finished = false;
        for row in &chunk.rows[1..] {
            line_ofs += 1;
            if row.len() == 1 && row[0] == SECTION_SENTINEL {
                finished = true;
                break;
            }
            if row.len() != 2 {
                self.errors.generic.push(format!(
                    "Malformed line {} (it should contain a day id and a period id)",
                    chunk.line + line_ofs - 1
                ));
                continue;
            }
            let (day_id, period_id) = (&row[0], &row[1]);

            let Some(day) = schema.day(day_id) else {
                push_unique(&mut self.errors.day_ids, day_id);
                continue;
            };
            if !day.has_period(period_id) {
                push_unique(&mut self.errors.periods, period_id);
                continue;
            }
            periods.push((day_id.clone(), period_id.clone()));
        }

        if !finished {
            self.errors.generic.push(format!(
                "Incomplete section description on line {}",
                chunk.line
            ));
            return Ok(());
        }
        if chunk.rows.len() == line_ofs {
            self.errors.generic.push(format!(
                "No students in section (line {})",
                chunk.line + line_ofs
            ));
            return Ok(());
        }

        let section_id = match (pass, course, instructor) {
            (Pass::Commit, Some(course), Some(instructor)) => {
                Some(self.create_section(&course, &instructor, &periods)?)
            }
            _ => None,
        };
        self.import_persons(&chunk.rows[line_ofs..], section_id.as_deref())
    }

    /// Creates the section, or reuses one with the same title, and gives it
    /// a timetable holding one activity per period.
    fn create_section(
        &mut self,
        course: &Course,
        instructor: &PersonRef,
        periods: &[(String, String)],
    ) -> anyhow::Result<String> {
        let conn = self.conn;
        let term_id = self.term.id.as_str();
        let title = format!("{} - {}", course.title, instructor.title);

        let section_id = match school::find_section_by_title(conn, term_id, &title)? {
            Some(id) => {
                self.summary.sections_reused.push(title);
                id
            }
            None => {
                let (id, name) = school::create_section(conn, term_id, &title, None)?;
                tracing::debug!(section = %name, %title, "created section");
                self.summary.sections_created.push(title);
                id
            }
        };

        conn.execute(
            "INSERT OR IGNORE INTO section_courses(section_id, course_id) VALUES(?, ?)",
            (&section_id, &course.id),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO section_instructors(section_id, person_id) VALUES(?, ?)",
            (&section_id, &instructor.id),
        )?;

        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no timetable schema resolved"))?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM timetables WHERE section_id = ? AND term_id = ? AND schema_id = ?",
                (&section_id, term_id, &schema.id),
                |r| r.get(0),
            )
            .optional()?;
        let timetable_id = match existing {
            Some(id) => id,
            None => {
                let taken = db::taken_names(conn, "timetables", "section_id", &section_id)?;
                let name = db::choose_name(
                    &taken,
                    &format!("{}.{}", self.term.name, schema.name),
                );
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO timetables(id, section_id, name, term_id, schema_id)
                     VALUES(?, ?, ?, ?, ?)",
                    (&id, &section_id, &name, term_id, &schema.id),
                )?;
                self.summary.timetables_created += 1;
                id
            }
        };

        // An identical activity already in the slot is kept as is.
        for (day_id, period_id) in periods {
            let added = conn.execute(
                "INSERT INTO timetable_activities(id, timetable_id, day_id, period_id, title, owner_section_id)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6
                 WHERE NOT EXISTS (
                   SELECT 1 FROM timetable_activities
                   WHERE timetable_id = ?2 AND day_id = ?3 AND period_id = ?4
                     AND title = ?5 AND owner_section_id = ?6
                 )",
                (
                    Uuid::new_v4().to_string(),
                    &timetable_id,
                    day_id,
                    period_id,
                    &course.title,
                    &section_id,
                ),
            )?;
            self.summary.activities_added += added;
        }

        Ok(section_id)
    }

    /// Looks up each student row; enrols them when a section is given.
    fn import_persons(&mut self, rows: &[Row], section_id: Option<&str>) -> Result<(), ImportError> {
        for row in rows {
            let person_id = &row[0];
            match school::find_person(self.conn, person_id)? {
                None => {
                    tracing::debug!(person = %person_id, "unknown person in timetable CSV");
                    push_unique(&mut self.errors.persons, person_id);
                }
                Some(person) => {
                    if let Some(section_id) = section_id {
                        let added = self.conn.execute(
                            "INSERT OR IGNORE INTO section_members(section_id, person_id) VALUES(?, ?)",
                            (section_id, &person.id),
                        )?;
                        self.summary.members_enrolled += added;
                    }
                }
            }
        }
        Ok(())
    }
}
