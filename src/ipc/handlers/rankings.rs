use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank;
use crate::stats;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn stats_err(req: &Request, e: stats::StatsError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_rank_percentile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_code = optional_str(req, "schoolCode");
    let subject = optional_str(req, "subject");

    let result = match rank::calculate_percentile(
        conn,
        &user_id,
        school_code.as_deref(),
        subject.as_deref(),
    ) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "percentile": stats::round1(result.percentile),
            "rank": result.rank,
            "total": result.total
        }),
    )
}

fn handle_rank_subjects_national(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match rank::subject_cohort_averages(conn, &level, None) {
        Ok(rows) => ok(&req.id, json!({ "subjects": shape_subject_rows(&rows) })),
        Err(e) => stats_err(req, e),
    }
}

fn handle_rank_subjects_school(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let school_code = match required_str(req, "schoolCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match rank::subject_cohort_averages(conn, &level, Some(&school_code)) {
        Ok(rows) => ok(&req.id, json!({ "subjects": shape_subject_rows(&rows) })),
        Err(e) => stats_err(req, e),
    }
}

fn shape_subject_rows(rows: &[rank::SubjectAverage]) -> Vec<serde_json::Value> {
    rows.iter()
        .map(|s| {
            json!({
                "subject": s.subject,
                "average": stats::round1(s.average),
                "gradeCount": s.grade_count
            })
        })
        .collect()
}

fn handle_schools_update_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match rank::update_school_stats_by_level(conn, &level) {
        Ok(rows) => ok(
            &req.id,
            json!({ "schoolsUpdated": rows.len(), "schools": rows }),
        ),
        Err(e) => stats_err(req, e),
    }
}

fn handle_schools_top(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = match req.params.get("limit") {
        None => 10,
        Some(v) if v.is_null() => 10,
        Some(v) => match v.as_u64() {
            Some(n) if (1..=100).contains(&n) => n as usize,
            _ => return err(&req.id, "bad_params", "limit must be in range 1..=100", None),
        },
    };

    match rank::top_schools(conn, &level, limit) {
        Ok(rows) => ok(&req.id, json!({ "schools": rows })),
        Err(e) => stats_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rank.percentile" => Some(handle_rank_percentile(state, req)),
        "rank.subjects.national" => Some(handle_rank_subjects_national(state, req)),
        "rank.subjects.school" => Some(handle_rank_subjects_school(state, req)),
        "schools.updateStats" => Some(handle_schools_update_stats(state, req)),
        "schools.top" => Some(handle_schools_top(state, req)),
        _ => None,
    }
}
