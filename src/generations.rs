//! Schema generations.
//!
//! Each workspace records the last generation it was evolved to. Opening a
//! workspace runs every newer step, oldest first, in a single transaction.

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};

use crate::db;

const GENERATION_KEY: &str = "schooltool.app";

pub const CURRENT_GENERATION: i64 = 2;

type EvolveStep = fn(&Connection) -> anyhow::Result<()>;

const STEPS: [(i64, EvolveStep); 2] = [(1, evolve_base), (2, evolve_contacts)];

pub fn stored_generation(conn: &Connection) -> anyhow::Result<i64> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT generation FROM generations WHERE key = ?",
            [GENERATION_KEY],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(0))
}

/// Brings the workspace up to `CURRENT_GENERATION` and returns it.
pub fn evolve(conn: &Connection) -> anyhow::Result<i64> {
    evolve_to(conn, CURRENT_GENERATION)
}

pub fn evolve_to(conn: &Connection, target: i64) -> anyhow::Result<i64> {
    let from = stored_generation(conn)?;
    if from >= target {
        return Ok(from);
    }

    let tx = conn
        .unchecked_transaction()
        .context("failed to start evolve transaction")?;
    for (generation, step) in STEPS.iter() {
        if *generation <= from || *generation > target {
            continue;
        }
        tracing::info!(generation, "evolving workspace");
        step(&tx).with_context(|| format!("evolve to generation {} failed", generation))?;
    }
    tx.execute(
        "INSERT INTO generations(key, generation) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET generation = excluded.generation",
        (GENERATION_KEY, target),
    )?;
    tx.commit().context("failed to commit evolve transaction")?;
    Ok(target)
}

// Tables for generation 1 are created by `db::init_schema`.
fn evolve_base(_conn: &Connection) -> anyhow::Result<()> {
    Ok(())
}

/// Binds a contact record to every person that lacks one.
fn evolve_contacts(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contacts(
            id TEXT PRIMARY KEY,
            person_id TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            form_key TEXT NOT NULL,
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    // Contacts tables created by hand before generation 2 have no form key.
    if !db::table_has_column(conn, "contacts", "form_key")? {
        conn.execute(
            "ALTER TABLE contacts ADD COLUMN form_key TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.username, p.first_name, p.last_name
         FROM persons p
         WHERE NOT EXISTS (SELECT 1 FROM contacts c WHERE c.person_id = p.id)
         ORDER BY p.username",
    )?;
    let pending = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (person_id, username, first_name, last_name) in pending {
        tracing::debug!(%username, "binding contact to person");
        conn.execute(
            "INSERT INTO contacts(id, person_id, first_name, last_name, form_key)
             VALUES(?, ?, ?, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                &person_id,
                &first_name,
                &last_name,
                &username,
            ),
        )?;
    }
    Ok(())
}
