use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match db::settings_get_json(conn, &user_id) {
        Ok(Some(settings)) => ok(&req.id, json!({ "settings": settings })),
        Ok(None) => ok(&req.id, json!({ "settings": serde_json::Value::Null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(settings) = req.params.get("settings") else {
        return err(&req.id, "bad_params", "missing settings", None);
    };
    if !settings.is_object() {
        return err(&req.id, "bad_params", "settings must be an object", None);
    }

    let user_known = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match user_known {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match db::settings_set_json(conn, &user_id, settings) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

/// Idempotent reconciliation of a client-cached profile blob against the
/// server row. Server non-empty fields always win; cached values only fill
/// server-side gaps. Running it again adopts nothing.
fn handle_profile_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(cached) = req.params.get("cached").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid cached", None);
    };

    let server: Option<(Option<String>, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT school_code, school_name, level FROM users WHERE id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((school_code, school_name, level)) = server else {
        return err(&req.id, "not_found", "user not found", None);
    };

    let mut adopted: Vec<&str> = Vec::new();
    let mut updates: Vec<(&str, String)> = Vec::new();
    for (param, column, current) in [
        ("schoolCode", "school_code", &school_code),
        ("schoolName", "school_name", &school_name),
        ("level", "level", &level),
    ] {
        let server_empty = current.as_deref().map(|s| s.is_empty()).unwrap_or(true);
        if !server_empty {
            continue;
        }
        let Some(value) = cached
            .get(param)
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        adopted.push(param);
        updates.push((column, value.to_string()));
    }

    if !updates.is_empty() {
        let set_clause = updates
            .iter()
            .map(|(column, _)| format!("{} = ?", column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE users SET {}, updated_at = ? WHERE id = ?", set_clause);
        let mut binds: Vec<rusqlite::types::Value> = updates
            .into_iter()
            .map(|(_, v)| rusqlite::types::Value::Text(v))
            .collect();
        binds.push(rusqlite::types::Value::Text(
            chrono::Utc::now().to_rfc3339(),
        ));
        binds.push(rusqlite::types::Value::Text(user_id.clone()));
        if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "adoptedFields": adopted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.set" => Some(handle_settings_set(state, req)),
        "profile.reconcile" => Some(handle_profile_reconcile(state, req)),
        _ => None,
    }
}
