use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Resolves the assessment date: an explicit ISO date wins; otherwise a
/// term+year pair synthesizes the fixed end-of-term day.
fn resolve_assessment_date(req: &Request) -> Result<String, String> {
    if let Some(raw) = req.params.get("assessmentDate") {
        let Some(s) = raw.as_str() else {
            return Err("assessmentDate must be a string".to_string());
        };
        if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
            return Err("assessmentDate must be formatted YYYY-MM-DD".to_string());
        }
        return Ok(s.to_string());
    }

    let term = req.params.get("term").and_then(|v| v.as_i64());
    let year = req.params.get("year").and_then(|v| v.as_i64());
    match (term, year) {
        (Some(t), Some(y)) => {
            let Ok(year) = i32::try_from(y) else {
                return Err("year out of range".to_string());
            };
            stats::term_end_date(year, t)
                .ok_or_else(|| "term must be in range 1..=4".to_string())
        }
        _ => Err("provide assessmentDate or term+year".to_string()),
    }
}

fn handle_grades_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let subject = match req.params.get("subject").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing subject", None),
    };
    if subject.is_empty() {
        return err(&req.id, "bad_params", "subject must not be empty", None);
    }
    let assessment_name = match req.params.get("assessmentName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing assessmentName", None),
    };
    if assessment_name.is_empty() {
        return err(&req.id, "bad_params", "assessmentName must not be empty", None);
    }
    let score = match req.params.get("score").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing score", None),
    };
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing maxScore", None),
    };
    if max_score <= 0.0 {
        return err(&req.id, "bad_params", "maxScore must be positive", None);
    }
    if score < 0.0 || score > max_score {
        return err(
            &req.id,
            "bad_params",
            "score must be in range 0..=maxScore",
            Some(json!({ "score": score, "maxScore": max_score })),
        );
    }
    let assessment_date = match resolve_assessment_date(req) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let user_exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match user_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let grade_id = Uuid::new_v4().to_string();
    let pct = stats::percentage(score, max_score);
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, user_id, subject, assessment_name, score, max_score,
                            percentage, assessment_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &user_id,
            &subject,
            &assessment_name,
            score,
            max_score,
            pct,
            &assessment_date,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "assessmentDate": assessment_date,
            "percentage": stats::clamp_percent(pct)
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let subject = req
        .params
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let limit = match req.params.get("limit") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Some(n as usize),
            _ => return err(&req.id, "bad_params", "limit must be a positive integer", None),
        },
    };

    let grades = match stats::load_user_grades(conn, &user_id, subject.as_deref(), limit) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let rows = grades
        .iter()
        .map(|g| {
            json!({
                "id": g.id,
                "subject": g.subject,
                "assessmentName": g.assessment_name,
                "score": g.score,
                "maxScore": g.max_score,
                "percentage": stats::clamp_percent(g.percentage),
                "assessmentDate": g.assessment_date,
                "createdAt": g.created_at
            })
        })
        .collect::<Vec<_>>();

    ok(&req.id, json!({ "grades": rows, "totalCount": rows.len() }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let grade_id = match req.params.get("gradeId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing gradeId", None),
    };

    let changed = match conn.execute(
        "DELETE FROM grades WHERE id = ? AND user_id = ?",
        (&grade_id, &user_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "grade not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.add" => Some(handle_grades_add(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
