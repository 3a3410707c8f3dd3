use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn stats_err(req: &Request, e: stats::StatsError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_stats_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match stats::compute_user_overview(conn, &user_id) {
        Ok(overview) => ok(&req.id, json!({ "overview": overview })),
        Err(e) => stats_err(req, e),
    }
}

fn handle_stats_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match stats::user_exists(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return stats_err(req, e),
    }
    let grades = match stats::load_user_grades(conn, &user_id, None, None) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };

    let subjects = stats::subject_stats(&grades)
        .into_iter()
        .map(|s| {
            json!({
                "subject": s.subject,
                "average": stats::round1(s.average),
                "trend": stats::round1(s.trend),
                "count": s.count
            })
        })
        .collect::<Vec<_>>();

    ok(&req.id, json!({ "subjects": subjects }))
}

fn handle_stats_terms(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match stats::user_exists(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return stats_err(req, e),
    }
    let grades = match stats::load_user_grades(conn, &user_id, None, None) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };

    let terms = stats::term_buckets(&grades)
        .into_iter()
        .map(|b| {
            json!({
                "year": b.year,
                "term": b.term,
                "average": stats::round1(b.average),
                "count": b.count
            })
        })
        .collect::<Vec<_>>();

    ok(&req.id, json!({ "terms": terms }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.overview" => Some(handle_stats_overview(state, req)),
        "stats.subjects" => Some(handle_stats_subjects(state, req)),
        "stats.terms" => Some(handle_stats_terms(state, req)),
        _ => None,
    }
}
