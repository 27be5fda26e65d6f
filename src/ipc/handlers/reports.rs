use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{load_section, SetupSection};
use crate::ipc::helpers::{db_conn, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::persons::{self, Person};
use rusqlite::OptionalExtension;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardSort {
    LastName,
    FirstName,
}

impl CardSort {
    fn parse(v: Option<&str>) -> Self {
        match v {
            Some("firstName") => Self::FirstName,
            _ => Self::LastName,
        }
    }
}

fn sort_for_cards(people: &mut [Person], sort: CardSort) {
    match sort {
        // linked_persons already returns last-name order.
        CardSort::LastName => {}
        CardSort::FirstName => people.sort_by(|a, b| {
            (a.first_name.to_lowercase(), a.last_name.to_lowercase())
                .cmp(&(b.first_name.to_lowercase(), b.last_name.to_lowercase()))
                .then_with(|| a.username.cmp(&b.username))
        }),
    }
}

/// Model for the group ID card PDF; the front end renders it.
fn handle_group_id_cards_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let group: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT g.name, g.title, sy.name
             FROM groups g
             JOIN school_years sy ON sy.id = g.school_year_id
             WHERE g.id = ?",
            [&group_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let Some((group_name, group_title, year_name)) = group else {
        return err(&req.id, "not_found", "group not found", None);
    };

    let setup = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let include_username = setup
        .get("idCardsIncludeUsername")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let sort = CardSort::parse(setup.get("idCardsSortBy").and_then(|v| v.as_str()));

    let mut members = match persons::linked_persons(conn, "group_members", "group_id", &group_id)
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    sort_for_cards(&mut members, sort);

    let cards: Vec<serde_json::Value> = members
        .iter()
        .map(|p| {
            let mut card = json!({
                "personId": p.id,
                "title": p.title,
                "firstName": p.first_name,
                "lastName": p.last_name,
                "hasPhoto": p.has_photo,
            });
            if include_username {
                card["username"] = json!(p.username);
            }
            card
        })
        .collect();

    ok(
        &req.id,
        json!({
            "title": format!("ID Cards for Group: {}", group_title),
            "filename": format!("id_cards_{}_{}.pdf", group_name, year_name),
            "cards": cards,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.groupIdCardsModel" => Some(handle_group_id_cards_model(state, req)),
        _ => None,
    }
}
