//! Embedded database access.
//!
//! The store is a single SQLite file. Connections are short-lived: every
//! operation opens its own connection and drops it when done, which keeps
//! the single-worker ownership model simple and avoids long-held locks.

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, info};

pub fn open_conn(database_path: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_path)
        .with_context(|| format!("failed to open database at {}", database_path))?;
    // Writers from the worker, the status callbacks and the bridge can
    // overlap; WAL plus a busy timeout keeps them from erroring out.
    conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        .context("failed to set database pragmas")?;
    Ok(conn)
}

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Schema history. Every entry must stay runnable against a database that
/// already has it applied: tables use CREATE IF NOT EXISTS and column
/// additions go through [`add_column_if_absent`].
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "create_call_queue",
        sql: "CREATE TABLE IF NOT EXISTS call_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            first_name TEXT NOT NULL DEFAULT '',
            full_name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL,
            province TEXT,
            retry_stage INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            scheduled_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_attempt_at TEXT,
            last_error TEXT,
            call_options TEXT NOT NULL DEFAULT '{}'
        )",
    },
    Migration {
        name: "create_calls",
        sql: "CREATE TABLE IF NOT EXISTS calls (
            call_sid TEXT PRIMARY KEY,
            to_number TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'initiated',
            created_at TEXT NOT NULL,
            signed_url TEXT,
            full_name TEXT,
            first_name TEXT,
            email TEXT,
            answered_by TEXT,
            available_slots TEXT,
            conversation_id TEXT,
            first_attempt_at TEXT,
            service TEXT NOT NULL DEFAULT 'Infissi',
            retry_scheduled BOOLEAN NOT NULL DEFAULT 0
        )",
    },
    Migration {
        name: "create_incoming_calls",
        sql: "CREATE TABLE IF NOT EXISTS incoming_calls (
            call_sid TEXT PRIMARY KEY,
            caller_number TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'initiated',
            created_at TEXT NOT NULL,
            conversation_id TEXT,
            stream_sid TEXT
        )",
    },
    Migration {
        name: "create_follow_ups",
        sql: "CREATE TABLE IF NOT EXISTS follow_ups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id TEXT NOT NULL,
            follow_up_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            province TEXT,
            service TEXT,
            created_at TEXT NOT NULL,
            last_error TEXT
        )",
    },
    Migration {
        name: "create_sales_reps",
        sql: "CREATE TABLE IF NOT EXISTS sales_reps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ghl_user_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            services TEXT NOT NULL DEFAULT '',
            provinces TEXT NOT NULL DEFAULT '',
            active BOOLEAN NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    },
    Migration {
        name: "create_crm_tokens",
        sql: "CREATE TABLE IF NOT EXISTS crm_tokens (
            location_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    },
];

/// Column additions that arrived after the tables shipped. Each one must
/// tolerate the column already existing.
const COLUMN_ADDITIONS: &[(&str, &str, &str)] = &[
    ("call_queue", "available_slots", "TEXT"),
    ("call_queue", "signed_url", "TEXT"),
    ("call_queue", "first_attempt_at", "TEXT"),
    ("calls", "province", "TEXT"),
    ("calls", "stream_sid", "TEXT"),
    ("calls", "transcript_summary", "TEXT"),
];

pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    for m in MIGRATIONS {
        diesel::sql_query(m.sql)
            .execute(conn)
            .with_context(|| format!("migration {} failed", m.name))?;
        debug!("migration {} ok", m.name);
    }

    for (table, column, ty) in COLUMN_ADDITIONS {
        add_column_if_absent(conn, table, column, ty)
            .with_context(|| format!("adding {}.{} failed", table, column))?;
    }

    info!("database schema up to date");
    Ok(())
}

/// `ALTER TABLE ADD COLUMN`, treating "duplicate column name" as success.
/// SQLite has no ADD COLUMN IF NOT EXISTS, so idempotence lives here.
fn add_column_if_absent(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    ty: &str,
) -> Result<()> {
    let stmt = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ty);
    match diesel::sql_query(stmt).execute(conn) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = memory_conn();
        // A second full run against the same database must not error.
        run_migrations(&mut conn).unwrap();
    }

    #[test]
    fn duplicate_column_is_tolerated() {
        let mut conn = memory_conn();
        add_column_if_absent(&mut conn, "calls", "province", "TEXT").unwrap();
        add_column_if_absent(&mut conn, "calls", "province", "TEXT").unwrap();
    }
}
