use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display rounding used across handlers: one decimal, half away from zero.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub subject: String,
    pub assessment_name: String,
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub assessment_date: String,
    pub created_at: String,
}

/// `100 * score / max_score`, guarded against a non-positive denominator.
pub fn percentage(score: f64, max_score: f64) -> f64 {
    if max_score > 0.0 {
        100.0 * score / max_score
    } else {
        0.0
    }
}

/// Display clamp. Stored rows may carry out-of-range percentages if a
/// malformed max_score ever slipped in; rendering never shows them.
pub fn clamp_percent(p: f64) -> f64 {
    p.clamp(0.0, 100.0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// 0-10 score penalizing dispersion: `10 - 0.2 * stddev`, clamped.
/// Not a named statistical metric; the scale is a product decision.
pub fn consistency_score(percentages: &[f64]) -> f64 {
    (10.0 - 0.2 * stddev(percentages)).clamp(0.0, 10.0)
}

/// Recent-vs-previous delta over percentages ordered newest first:
/// mean of the newest min(3, n) minus mean of the next up-to-3 older ones.
/// With no older grades there is nothing to compare against, so 0.
pub fn overall_trend(percentages_newest_first: &[f64]) -> f64 {
    let recent_len = percentages_newest_first.len().min(3);
    let recent = &percentages_newest_first[..recent_len];
    let older: Vec<f64> = percentages_newest_first
        .iter()
        .skip(recent_len)
        .take(3)
        .copied()
        .collect();
    if older.is_empty() {
        return 0.0;
    }
    mean(recent) - mean(&older)
}

/// Calendar-quarter term: Jan-Mar 1, Apr-Jun 2, Jul-Sep 3, Oct-Dec 4.
pub fn term_for_month(month: u32) -> i64 {
    match month {
        1..=3 => 1,
        4..=6 => 2,
        7..=9 => 3,
        _ => 4,
    }
}

pub fn term_for_date(date: &str) -> Option<i64> {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(term_for_month(d.month()))
}

/// Synthesized assessment date for a grade entered by term+year rather than
/// an explicit date: the fixed end-of-term day.
pub fn term_end_date(year: i32, term: i64) -> Option<String> {
    let (month, day) = match term {
        1 => (3, 31),
        2 => (6, 30),
        3 => (9, 30),
        4 => (12, 31),
        _ => return None,
    };
    let d = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(d.format("%Y-%m-%d").to_string())
}

/// English ordinal suffix; ranks below 1 display as "1st".
pub fn ordinal(rank: i64) -> String {
    let r = rank.max(1);
    let suffix = match (r % 10, r % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", r, suffix)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject: String,
    pub average: f64,
    pub trend: f64,
    pub count: usize,
}

/// Per-subject mean and chronological trend. Subjects group by exact,
/// case-sensitive string match; output order is lexicographic by subject,
/// which also fixes the tie-break order for best/most-improved selection.
pub fn subject_stats(grades: &[GradeRecord]) -> Vec<SubjectStats> {
    let mut by_subject: BTreeMap<&str, Vec<&GradeRecord>> = BTreeMap::new();
    for g in grades {
        by_subject.entry(g.subject.as_str()).or_default().push(g);
    }

    let mut out = Vec::with_capacity(by_subject.len());
    for (subject, mut rows) in by_subject {
        // ISO dates compare correctly as strings; created_at settles
        // same-day ordering.
        rows.sort_by(|a, b| {
            a.assessment_date
                .cmp(&b.assessment_date)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let percentages: Vec<f64> = rows.iter().map(|g| g.percentage).collect();
        let trend = if percentages.len() >= 2 {
            percentages[percentages.len() - 1] - percentages[0]
        } else {
            0.0
        };
        out.push(SubjectStats {
            subject: subject.to_string(),
            average: mean(&percentages),
            trend,
            count: percentages.len(),
        });
    }
    out
}

/// Subject with the highest mean; ties resolve to the lexicographically
/// smallest subject because the input is sorted and only a strictly greater
/// average replaces the current pick.
pub fn best_subject(stats: &[SubjectStats]) -> Option<&SubjectStats> {
    let mut best: Option<&SubjectStats> = None;
    for s in stats {
        if best.map(|b| s.average > b.average).unwrap_or(true) {
            best = Some(s);
        }
    }
    best
}

/// Subject with the largest strictly positive last-minus-first delta among
/// subjects with at least two grades. Deltas <= 0 never win.
pub fn most_improved_subject(stats: &[SubjectStats]) -> Option<&SubjectStats> {
    let mut best: Option<&SubjectStats> = None;
    for s in stats {
        if s.count < 2 || s.trend <= 0.0 {
            continue;
        }
        if best.map(|b| s.trend > b.trend).unwrap_or(true) {
            best = Some(s);
        }
    }
    best
}

pub fn overall_average(grades: &[GradeRecord]) -> f64 {
    let percentages: Vec<f64> = grades.iter().map(|g| g.percentage).collect();
    mean(&percentages)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewModel {
    pub overall_average: f64,
    pub overall_trend: f64,
    pub consistency: f64,
    pub best_subject: Option<String>,
    pub most_improved_subject: Option<String>,
    pub grade_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermBucket {
    pub year: i32,
    pub term: i64,
    pub average: f64,
    pub count: usize,
}

/// Term/year buckets, newest bucket first. Grades whose dates fail to parse
/// are skipped rather than failing the whole aggregation.
pub fn term_buckets(grades: &[GradeRecord]) -> Vec<TermBucket> {
    let mut by_bucket: BTreeMap<(i32, i64), Vec<f64>> = BTreeMap::new();
    for g in grades {
        let Ok(d) = NaiveDate::parse_from_str(&g.assessment_date, "%Y-%m-%d") else {
            continue;
        };
        by_bucket
            .entry((d.year(), term_for_month(d.month())))
            .or_default()
            .push(g.percentage);
    }
    by_bucket
        .into_iter()
        .rev()
        .map(|((year, term), percentages)| TermBucket {
            year,
            term,
            average: mean(&percentages),
            count: percentages.len(),
        })
        .collect()
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, StatsError> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

/// Loads a user's grades newest first (the order every view consumes).
pub fn load_user_grades(
    conn: &Connection,
    user_id: &str,
    subject: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<GradeRecord>, StatsError> {
    let mut sql = String::from(
        "SELECT id, subject, assessment_name, score, max_score, percentage,
                assessment_date, created_at
         FROM grades
         WHERE user_id = ?",
    );
    if subject.is_some() {
        sql.push_str(" AND subject = ?");
    }
    sql.push_str(" ORDER BY assessment_date DESC, created_at DESC");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<GradeRecord> {
        Ok(GradeRecord {
            id: r.get(0)?,
            subject: r.get(1)?,
            assessment_name: r.get(2)?,
            score: r.get(3)?,
            max_score: r.get(4)?,
            percentage: r.get(5)?,
            assessment_date: r.get(6)?,
            created_at: r.get(7)?,
        })
    };
    let rows = if let Some(subj) = subject {
        stmt.query_map([user_id, subj], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([user_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };
    rows.map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

/// Dashboard overview for one user: the consolidated aggregator output.
pub fn compute_user_overview(
    conn: &Connection,
    user_id: &str,
) -> Result<OverviewModel, StatsError> {
    if !user_exists(conn, user_id)? {
        return Err(StatsError::new("not_found", "user not found"));
    }
    let grades = load_user_grades(conn, user_id, None, None)?;

    let percentages_desc: Vec<f64> = grades.iter().map(|g| g.percentage).collect();
    let per_subject = subject_stats(&grades);
    let best = best_subject(&per_subject).map(|s| s.subject.clone());
    let improved = most_improved_subject(&per_subject).map(|s| s.subject.clone());

    Ok(OverviewModel {
        overall_average: round1(overall_average(&grades)),
        overall_trend: round1(overall_trend(&percentages_desc)),
        consistency: round1(consistency_score(&percentages_desc)),
        best_subject: best,
        most_improved_subject: improved,
        grade_count: grades.len(),
    })
}
