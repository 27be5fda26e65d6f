use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::persons::{self, Preferences};
use crate::timetable_csv;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
pub enum SetupSection {
    Import,
    Persons,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "persons" => Some(Self::Persons),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Import => "setup.import",
            Self::Persons => "setup.persons",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Import => json!({
            "defaultCharset": null,
            "maxBytes": 4 * 1024 * 1024
        }),
        SetupSection::Persons => {
            let prefs = Preferences::default();
            json!({
                "timezone": prefs.timezone,
                "timeFormat": prefs.time_format,
                "dateFormat": prefs.date_format,
                "weekStart": prefs.week_start,
                "calPeriods": prefs.cal_periods,
                "calPublic": prefs.cal_public
            })
        }
        SetupSection::Reports => json!({
            "idCardsIncludeUsername": true,
            "idCardsSortBy": "lastName"
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Import => match k.as_str() {
                "defaultCharset" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                        continue;
                    }
                    let label = parse_string_max(v, k, 40)?;
                    if timetable_csv::resolve_charset(&label).is_err() {
                        return Err(format!("unknown charset: {}", label));
                    }
                    obj.insert(k.clone(), Value::String(label));
                }
                "maxBytes" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, 1024, 64 * 1024 * 1024)?),
                    );
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
            SetupSection::Persons => match k.as_str() {
                "timezone" => {
                    let tz = parse_string_max(v, k, 64)?;
                    if tz.is_empty() {
                        return Err("timezone must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(tz));
                }
                "timeFormat" => {
                    let s = parse_string_max(v, k, 16)?;
                    if !persons::TIME_FORMATS.contains(&s.as_str()) {
                        return Err(format!(
                            "timeFormat must be one of: {}",
                            persons::TIME_FORMATS.join(", ")
                        ));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "dateFormat" => {
                    let s = parse_string_max(v, k, 16)?;
                    if !persons::DATE_FORMATS.contains(&s.as_str()) {
                        return Err(format!(
                            "dateFormat must be one of: {}",
                            persons::DATE_FORMATS.join(", ")
                        ));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "weekStart" => {
                    let n = match v.as_str() {
                        Some(name) => persons::week_start_from_name(name)
                            .ok_or_else(|| format!("unknown weekStart: {}", name))?,
                        None => parse_i64_range(v, k, 0, 6)?,
                    };
                    if !persons::WEEK_STARTS.iter().any(|(_, d)| *d == n) {
                        return Err("weekStart must be saturday, sunday or monday".into());
                    }
                    obj.insert(k.clone(), Value::from(n));
                }
                "calPeriods" | "calPublic" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown persons field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "idCardsIncludeUsername" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "idCardsSortBy" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    let canonical = match s.as_str() {
                        "lastname" => "lastName",
                        "firstname" => "firstName",
                        _ => return Err("idCardsSortBy must be one of: lastName, firstName".into()),
                    };
                    obj.insert(k.clone(), Value::String(canonical.to_string()));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Default display preferences for persons that have not saved their own.
pub fn default_preferences(conn: &rusqlite::Connection) -> anyhow::Result<Preferences> {
    let v = load_section(conn, SetupSection::Persons)?;
    Ok(serde_json::from_value(v)?)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let import = match load_section(conn, SetupSection::Import) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let persons = match load_section(conn, SetupSection::Persons) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "import": import,
            "persons": persons,
            "reports": reports
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
