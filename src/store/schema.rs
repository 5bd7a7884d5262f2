// src/store/schema.rs

//! SQLite schema for the state store
//!
//! Tables mirror the in-memory model: applications with their commands and
//! revisions, and transactions with their per-application states and logs.
//! Child rows cascade with their parent.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current state schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying state schema migration {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::Fatal(format!("unknown schema version {version}"))),
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE applications (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            arguments TEXT,
            type TEXT NOT NULL,
            FOREIGN KEY (application_id) REFERENCES applications(id) ON DELETE CASCADE
        );

        CREATE TABLE revisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL,
            channel TEXT NOT NULL,
            major INTEGER NOT NULL,
            minor INTEGER NOT NULL,
            patch INTEGER NOT NULL,
            revision INTEGER NOT NULL,
            tag TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL,
            FOREIGN KEY (application_id) REFERENCES applications(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_revisions_application ON revisions(application_id);

        CREATE TABLE transactions (
            id INTEGER PRIMARY KEY,
            type INTEGER NOT NULL,
            flags INTEGER NOT NULL DEFAULT 0,
            state INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            wait_type INTEGER NOT NULL DEFAULT 0,
            wait_data TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE INDEX idx_transactions_completed ON transactions(completed_at);

        CREATE TABLE transactions_state (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            channel TEXT,
            revision INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
        );

        CREATE TABLE transaction_logs (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            level INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            state INTEGER NOT NULL,
            message TEXT NOT NULL,
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_transaction_logs_transaction ON transaction_logs(transaction_id);
        ",
    )?;
    Ok(())
}
