use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("outrank.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            nickname TEXT NOT NULL,
            school_code TEXT,
            school_name TEXT,
            level TEXT,
            opted_in_cohort INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_school_level ON users(school_code, level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            assessment_name TEXT NOT NULL,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            percentage REAL NOT NULL,
            assessment_date TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_user ON grades(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_user_subject ON grades(user_id, subject)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_user_date ON grades(user_id, assessment_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_stats(
            school_code TEXT NOT NULL,
            level TEXT NOT NULL,
            school_name TEXT,
            average_overall REAL NOT NULL,
            national_rank INTEGER NOT NULL,
            total_students INTEGER NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(school_code, level)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_stats_level ON school_stats(level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            invite_code TEXT NOT NULL UNIQUE,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            PRIMARY KEY(group_id, user_id),
            FOREIGN KEY(group_id) REFERENCES groups(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS local_settings(
            user_id TEXT PRIMARY KEY,
            settings_json TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    // Early workspaces predate the cohort opt-in flag and the school_stats
    // display name. Add and backfill if needed.
    ensure_users_opted_in_cohort(&conn)?;
    ensure_school_stats_school_name(&conn)?;

    Ok(conn)
}

fn ensure_users_opted_in_cohort(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "opted_in_cohort")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE users ADD COLUMN opted_in_cohort INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_school_stats_school_name(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "school_stats", "school_name")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE school_stats ADD COLUMN school_name TEXT", [])?;
    Ok(())
}

pub fn settings_set_json(
    conn: &Connection,
    user_id: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO local_settings(user_id, settings_json, updated_at) VALUES(?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET settings_json = excluded.settings_json,
                                            updated_at = excluded.updated_at",
        (user_id, &text, &now),
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    user_id: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT settings_json FROM local_settings WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    match text {
        Some(t) => Ok(Some(serde_json::from_str(&t)?)),
        None => Ok(None),
    }
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
