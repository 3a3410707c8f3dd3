use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const NICKNAME_MIN: usize = 2;
const NICKNAME_MAX: usize = 20;

fn validate_nickname(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if !(NICKNAME_MIN..=NICKNAME_MAX).contains(&len) {
        return Err(format!(
            "nickname must be {}-{} characters",
            NICKNAME_MIN, NICKNAME_MAX
        ));
    }
    Ok(trimmed.to_string())
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let nickname = match req.params.get("nickname").and_then(|v| v.as_str()) {
        Some(v) => match validate_nickname(v) {
            Ok(n) => n,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
        None => return err(&req.id, "bad_params", "missing nickname", None),
    };
    let school_code = req
        .params
        .get("schoolCode")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let school_name = req
        .params
        .get("schoolName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let level = req
        .params
        .get("level")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let opted_in = req
        .params
        .get("optedInCohort")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let user_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, nickname, school_code, school_name, level, opted_in_cohort, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &nickname,
            &school_code,
            &school_name,
            &level,
            opted_in as i64,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let row = conn
        .query_row(
            "SELECT id, nickname, school_code, school_name, level, opted_in_cohort,
                    created_at, updated_at
             FROM users WHERE id = ?",
            [&user_id],
            |r| {
                let id: String = r.get(0)?;
                let nickname: String = r.get(1)?;
                let school_code: Option<String> = r.get(2)?;
                let school_name: Option<String> = r.get(3)?;
                let level: Option<String> = r.get(4)?;
                let opted_in: i64 = r.get(5)?;
                let created_at: String = r.get(6)?;
                let updated_at: Option<String> = r.get(7)?;
                Ok(json!({
                    "id": id,
                    "nickname": nickname,
                    "schoolCode": school_code,
                    "schoolName": school_name,
                    "level": level,
                    "optedInCohort": opted_in != 0,
                    "createdAt": created_at,
                    "updatedAt": updated_at
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(user)) => ok(&req.id, json!({ "user": user })),
        Ok(None) => err(&req.id, "not_found", "user not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("nickname") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.nickname must be a string", None);
        };
        let nickname = match validate_nickname(s) {
            Ok(n) => n,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        };
        set_parts.push("nickname = ?".into());
        bind_values.push(Value::Text(nickname));
    }
    for (param, column) in [
        ("schoolCode", "school_code"),
        ("schoolName", "school_name"),
        ("level", "level"),
    ] {
        if let Some(v) = patch.get(param) {
            if v.is_null() {
                set_parts.push(format!("{} = ?", column));
                bind_values.push(Value::Null);
            } else if let Some(s) = v.as_str() {
                set_parts.push(format!("{} = ?", column));
                bind_values.push(Value::Text(s.trim().to_string()));
            } else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string or null", param),
                    None,
                );
            }
        }
    }
    if let Some(v) = patch.get("optedInCohort") {
        let Some(b) = v.as_bool() else {
            return err(
                &req.id,
                "bad_params",
                "patch.optedInCohort must be a boolean",
                None,
            );
        };
        set_parts.push("opted_in_cohort = ?".into());
        bind_values.push(Value::Integer(b as i64));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(chrono::Utc::now().to_rfc3339()));

    let sql = format!("UPDATE users SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(user_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "user not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

/// The delete_user_and_data contract: one transaction removing the user's
/// grades, memberships, created groups (with those groups' memberships),
/// settings, and finally the user row.
fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.transaction() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    let result = (|| -> rusqlite::Result<()> {
        tx.execute("DELETE FROM grades WHERE user_id = ?", [&user_id])?;
        tx.execute(
            "DELETE FROM group_members
             WHERE group_id IN (SELECT id FROM groups WHERE created_by = ?)",
            [&user_id],
        )?;
        tx.execute("DELETE FROM group_members WHERE user_id = ?", [&user_id])?;
        tx.execute("DELETE FROM groups WHERE created_by = ?", [&user_id])?;
        tx.execute("DELETE FROM local_settings WHERE user_id = ?", [&user_id])?;
        tx.execute("DELETE FROM users WHERE id = ?", [&user_id])?;
        Ok(())
    })();
    if let Err(e) = result {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
