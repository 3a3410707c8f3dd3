use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank;
use crate::stats;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLE_ADMIN: &str = "admin";
const ROLE_MEMBER: &str = "member";

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn stats_err(req: &Request, e: stats::StatsError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn user_exists(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn group_exists(conn: &Connection, group_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM groups WHERE id = ?", [group_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn member_role(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT role FROM group_members WHERE group_id = ? AND user_id = ?",
        (group_id, user_id),
        |r| r.get(0),
    )
    .optional()
}

/// 8-char uppercase invite code; collisions are retried a few times before
/// giving up (the keyspace makes exhaustion effectively unreachable).
fn fresh_invite_code(conn: &Connection) -> rusqlite::Result<Option<String>> {
    for _ in 0..8 {
        let code = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        let taken = conn
            .query_row(
                "SELECT 1 FROM groups WHERE invite_code = ?",
                [&code],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if !taken {
            return Ok(Some(code));
        }
    }
    Ok(None)
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    match user_exists(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let invite_code = match fresh_invite_code(conn) {
        Ok(Some(code)) => code,
        Ok(None) => {
            return err(
                &req.id,
                "db_insert_failed",
                "could not allocate a unique invite code",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let group_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO groups(id, name, invite_code, created_by, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&group_id, &name, &invite_code, &user_id, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "groups" })),
        );
    }
    if let Err(e) = conn.execute(
        "INSERT INTO group_members(group_id, user_id, role, joined_at)
         VALUES(?, ?, ?, ?)",
        (&group_id, &user_id, ROLE_ADMIN, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "group_members" })),
        );
    }

    ok(
        &req.id,
        json!({ "groupId": group_id, "inviteCode": invite_code }),
    )
}

fn handle_groups_join(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let invite_code = match req.params.get("inviteCode").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_uppercase(),
        None => return err(&req.id, "bad_params", "missing inviteCode", None),
    };

    match user_exists(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let group: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, name FROM groups WHERE invite_code = ?",
            [&invite_code],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((group_id, group_name)) = group else {
        return err(&req.id, "not_found", "no group with that invite code", None);
    };

    // Joining twice is a no-op; the client retry path depends on it.
    match member_role(conn, &group_id, &user_id) {
        Ok(Some(role)) => {
            return ok(
                &req.id,
                json!({
                    "groupId": group_id,
                    "name": group_name,
                    "role": role,
                    "alreadyMember": true
                }),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO group_members(group_id, user_id, role, joined_at)
         VALUES(?, ?, ?, ?)",
        (&group_id, &user_id, ROLE_MEMBER, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "group_members" })),
        );
    }

    ok(
        &req.id,
        json!({
            "groupId": group_id,
            "name": group_name,
            "role": ROLE_MEMBER,
            "alreadyMember": false
        }),
    )
}

fn handle_groups_leave(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match member_role(conn, &group_id, &user_id) {
        Ok(Some(role)) => {
            // Role transfer is not implemented; the admin deletes the group
            // instead of leaving it.
            if role == ROLE_ADMIN {
                return err(
                    &req.id,
                    "forbidden",
                    "group admin cannot leave; delete the group instead",
                    None,
                );
            }
        }
        Ok(None) => return err(&req.id, "not_found", "membership not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute(
        "DELETE FROM group_members WHERE group_id = ? AND user_id = ?",
        (&group_id, &user_id),
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

/// The get_user_groups contract: groups the user belongs to, with role and
/// member count.
fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.name, g.invite_code, g.created_by, gm.role, gm.joined_at,
                (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
         FROM group_members gm
         JOIN groups g ON g.id = gm.group_id
         WHERE gm.user_id = ?
         ORDER BY gm.joined_at, g.name",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&user_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let invite_code: String = r.get(2)?;
            let created_by: String = r.get(3)?;
            let role: String = r.get(4)?;
            let joined_at: String = r.get(5)?;
            let member_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "inviteCode": invite_code,
                "createdBy": created_by,
                "role": role,
                "joinedAt": joined_at,
                "memberCount": member_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groups_is_member(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match member_role(conn, &group_id, &user_id) {
        Ok(role) => ok(
            &req.id,
            json!({ "isMember": role.is_some(), "role": role }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groups_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match rank::group_comprehensive_stats(conn, &group_id) {
        Ok(model) => ok(&req.id, json!({ "stats": model })),
        Err(e) => stats_err(req, e),
    }
}

fn handle_groups_rankings(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = req
        .params
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if req.method == "groups.subjectRankings" && subject.is_none() {
        return err(&req.id, "bad_params", "missing subject", None);
    }

    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match rank::group_rankings(conn, &group_id, subject.as_deref()) {
        Ok(rows) => ok(&req.id, json!({ "rankings": rows })),
        Err(e) => stats_err(req, e),
    }
}

/// The delete_group contract: admin only; memberships go first, then the
/// group row.
fn handle_groups_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match member_role(conn, &group_id, &user_id) {
        Ok(Some(role)) if role == ROLE_ADMIN => {}
        Ok(_) => {
            return err(
                &req.id,
                "forbidden",
                "only the group admin can delete a group",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.transaction() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    let result = (|| -> rusqlite::Result<()> {
        tx.execute("DELETE FROM group_members WHERE group_id = ?", [&group_id])?;
        tx.execute("DELETE FROM groups WHERE id = ?", [&group_id])?;
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
        "groups.create" => Some(handle_groups_create(state, req)),
        "groups.join" => Some(handle_groups_join(state, req)),
        "groups.leave" => Some(handle_groups_leave(state, req)),
        "groups.list" => Some(handle_groups_list(state, req)),
        "groups.isMember" => Some(handle_groups_is_member(state, req)),
        "groups.stats" => Some(handle_groups_stats(state, req)),
        "groups.rankings" | "groups.subjectRankings" => Some(handle_groups_rankings(state, req)),
        "groups.delete" => Some(handle_groups_delete(state, req)),
        _ => None,
    }
}
