use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;

use crate::stats::{self, StatsError};

/// Rank/percentile for one user against a cohort. `rank` is competition
/// ranking (1 + number of strictly greater averages); `percentile` is
/// `100 * (total - rank) / total`, so a cohort of one sits at 0.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileResult {
    pub percentile: f64,
    pub rank: i64,
    pub total: i64,
}

/// Placeholder returned whenever a cohort cannot be built: the user stands
/// alone. Callers can always render this shape.
pub fn default_percentile() -> PercentileResult {
    PercentileResult {
        percentile: 0.0,
        rank: 1,
        total: 1,
    }
}

fn clamp_rank(rank: i64, total: i64) -> i64 {
    rank.clamp(1, total.max(1))
}

/// The `calculate_percentile` contract. Cohort: opted-in users at the target
/// user's level (plus the target themselves), optionally restricted to one
/// school; metric: mean grade percentage, per-subject when `subject` is
/// given. Users with no qualifying grades drop out of the cohort.
pub fn calculate_percentile(
    conn: &Connection,
    user_id: &str,
    school_code: Option<&str>,
    subject: Option<&str>,
) -> Result<PercentileResult, StatsError> {
    let level: Option<String> = conn
        .query_row("SELECT level FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| StatsError::new("not_found", "user not found"))?;

    let mut sql = String::from(
        "SELECT u.id, AVG(g.percentage) AS avg_pct
         FROM users u
         JOIN grades g ON g.user_id = u.id
         WHERE (u.opted_in_cohort = 1 OR u.id = ?)
           AND u.level IS ?",
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(user_id.to_string()),
        level.map(Value::Text).unwrap_or(Value::Null),
    ];
    if let Some(code) = school_code {
        sql.push_str(" AND u.school_code = ?");
        binds.push(Value::Text(code.to_string()));
    }
    if let Some(subj) = subject {
        sql.push_str(" AND g.subject = ?");
        binds.push(Value::Text(subj.to_string()));
    }
    sql.push_str(" GROUP BY u.id");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let rows: Vec<(String, f64)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    let Some(target_avg) = rows
        .iter()
        .find(|(id, _)| id == user_id)
        .map(|(_, avg)| *avg)
    else {
        return Ok(default_percentile());
    };

    let total = rows.len() as i64;
    let rank = 1 + rows.iter().filter(|(_, avg)| *avg > target_avg).count() as i64;
    let rank = clamp_rank(rank, total);
    let percentile = if total > 0 {
        100.0 * (total - rank) as f64 / total as f64
    } else {
        0.0
    };

    Ok(PercentileResult {
        percentile,
        rank,
        total,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub average: f64,
    pub grade_count: i64,
}

/// Per-subject cohort averages: the `get_national_subject_averages` /
/// `get_school_subject_averages` contracts (school-scoped when `school_code`
/// is given).
pub fn subject_cohort_averages(
    conn: &Connection,
    level: &str,
    school_code: Option<&str>,
) -> Result<Vec<SubjectAverage>, StatsError> {
    let mut sql = String::from(
        "SELECT g.subject, AVG(g.percentage), COUNT(*)
         FROM grades g
         JOIN users u ON u.id = g.user_id
         WHERE u.opted_in_cohort = 1 AND u.level = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(level.to_string())];
    if let Some(code) = school_code {
        sql.push_str(" AND u.school_code = ?");
        binds.push(Value::Text(code.to_string()));
    }
    sql.push_str(" GROUP BY g.subject ORDER BY g.subject");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    stmt.query_map(params_from_iter(binds), |r| {
        Ok(SubjectAverage {
            subject: r.get(0)?,
            average: r.get(1)?,
            grade_count: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolStatsRow {
    pub school_code: String,
    pub school_name: Option<String>,
    pub level: String,
    pub average_overall: f64,
    pub national_rank: i64,
    pub total_students: i64,
}

/// The `update_school_stats_by_level` contract: recompute `school_stats` for
/// every school with opted-in, graded users at `level`. A school's average is
/// the mean of its students' per-user averages (so one prolific student does
/// not outweigh the rest). Rank ties share a rank; stale rows for the level
/// are removed.
pub fn update_school_stats_by_level(
    conn: &mut Connection,
    level: &str,
) -> Result<Vec<SchoolStatsRow>, StatsError> {
    #[derive(Debug)]
    struct SchoolAgg {
        school_code: String,
        school_name: Option<String>,
        average: f64,
        students: i64,
    }

    let mut stmt = conn
        .prepare(
            "SELECT u.school_code, MAX(u.school_name), AVG(per_user.avg_pct), COUNT(*)
             FROM (SELECT user_id, AVG(percentage) AS avg_pct
                   FROM grades GROUP BY user_id) per_user
             JOIN users u ON u.id = per_user.user_id
             WHERE u.opted_in_cohort = 1 AND u.level = ? AND u.school_code IS NOT NULL
             GROUP BY u.school_code",
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let mut schools: Vec<SchoolAgg> = stmt
        .query_map([level], |r| {
            Ok(SchoolAgg {
                school_code: r.get(0)?,
                school_name: r.get(1)?,
                average: r.get(2)?,
                students: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    drop(stmt);

    schools.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.school_code.cmp(&b.school_code))
    });

    let ranked: Vec<SchoolStatsRow> = schools
        .iter()
        .map(|s| {
            let rank = 1 + schools.iter().filter(|o| o.average > s.average).count() as i64;
            SchoolStatsRow {
                school_code: s.school_code.clone(),
                school_name: s.school_name.clone(),
                level: level.to_string(),
                average_overall: stats::round1(s.average),
                national_rank: rank,
                total_students: s.students,
            }
        })
        .collect();

    let tx = conn
        .transaction()
        .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    tx.execute("DELETE FROM school_stats WHERE level = ?", [level])
        .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    let now = chrono::Utc::now().to_rfc3339();
    for row in &ranked {
        tx.execute(
            "INSERT INTO school_stats(school_code, level, school_name, average_overall,
                                      national_rank, total_students, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &row.school_code,
                &row.level,
                &row.school_name,
                row.average_overall,
                row.national_rank,
                row.total_students,
                &now,
            ),
        )
        .map_err(|e| StatsError::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;

    Ok(ranked)
}

/// Top schools at a level, best average first.
pub fn top_schools(
    conn: &Connection,
    level: &str,
    limit: usize,
) -> Result<Vec<SchoolStatsRow>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT school_code, school_name, level, average_overall, national_rank, total_students
             FROM school_stats
             WHERE level = ?
             ORDER BY national_rank, school_code
             LIMIT ?",
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    stmt.query_map((level, limit as i64), |r| {
        Ok(SchoolStatsRow {
            school_code: r.get(0)?,
            school_name: r.get(1)?,
            level: r.get(2)?,
            average_overall: r.get(3)?,
            national_rank: r.get(4)?,
            total_students: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRankingRow {
    pub user_id: String,
    pub nickname: String,
    pub role: String,
    pub average: f64,
    pub grade_count: i64,
    pub rank: i64,
    pub ordinal: String,
}

/// The `get_group_rankings` / `get_group_subject_rankings` contracts:
/// members ranked by mean percentage (subject-restricted when given).
/// Members with no qualifying grades are excluded; ties share a rank and
/// order by ascending nickname.
pub fn group_rankings(
    conn: &Connection,
    group_id: &str,
    subject: Option<&str>,
) -> Result<Vec<GroupRankingRow>, StatsError> {
    let mut sql = String::from(
        "SELECT u.id, u.nickname, gm.role, AVG(g.percentage), COUNT(g.id)
         FROM group_members gm
         JOIN users u ON u.id = gm.user_id
         JOIN grades g ON g.user_id = u.id
         WHERE gm.group_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(group_id.to_string())];
    if let Some(subj) = subject {
        sql.push_str(" AND g.subject = ?");
        binds.push(Value::Text(subj.to_string()));
    }
    sql.push_str(" GROUP BY u.id, u.nickname, gm.role");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let mut members: Vec<(String, String, String, f64, i64)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    members.sort_by(|a, b| {
        b.3.partial_cmp(&a.3)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });

    let out = members
        .iter()
        .map(|(user_id, nickname, role, average, grade_count)| {
            let rank = 1 + members.iter().filter(|m| m.3 > *average).count() as i64;
            let rank = clamp_rank(rank, members.len() as i64);
            GroupRankingRow {
                user_id: user_id.clone(),
                nickname: nickname.clone(),
                role: role.clone(),
                average: stats::round1(*average),
                grade_count: *grade_count,
                rank,
                ordinal: stats::ordinal(rank),
            }
        })
        .collect();
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatsModel {
    pub member_count: i64,
    pub graded_member_count: i64,
    pub group_average: f64,
    pub top_performer: Option<GroupRankingRow>,
    pub subjects: Vec<SubjectAverage>,
}

/// The `get_group_comprehensive_stats` contract: headline numbers plus a
/// per-subject breakdown across all members' grades.
pub fn group_comprehensive_stats(
    conn: &Connection,
    group_id: &str,
) -> Result<GroupStatsModel, StatsError> {
    let member_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?",
            [group_id],
            |r| r.get(0),
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    let rankings = group_rankings(conn, group_id, None)?;
    let averages: Vec<f64> = rankings.iter().map(|r| r.average).collect();
    let group_average = stats::round1(stats::mean(&averages));
    let top_performer = rankings.first().cloned();

    let mut stmt = conn
        .prepare(
            "SELECT g.subject, AVG(g.percentage), COUNT(*)
             FROM group_members gm
             JOIN grades g ON g.user_id = gm.user_id
             WHERE gm.group_id = ?
             GROUP BY g.subject
             ORDER BY g.subject",
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let subjects = stmt
        .query_map([group_id], |r| {
            Ok(SubjectAverage {
                subject: r.get(0)?,
                average: r.get(1)?,
                grade_count: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    Ok(GroupStatsModel {
        member_count,
        graded_member_count: rankings.len() as i64,
        group_average,
        top_performer,
        subjects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_percentile_is_the_lone_user_shape() {
        let d = default_percentile();
        assert_eq!(d.percentile, 0.0);
        assert_eq!(d.rank, 1);
        assert_eq!(d.total, 1);
    }

    #[test]
    fn clamp_rank_stays_in_bounds() {
        assert_eq!(clamp_rank(0, 5), 1);
        assert_eq!(clamp_rank(7, 5), 5);
        assert_eq!(clamp_rank(3, 5), 3);
        assert_eq!(clamp_rank(2, 0), 1);
    }
}
