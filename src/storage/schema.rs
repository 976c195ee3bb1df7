//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS targets (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS simulations (
            kind TEXT PRIMARY KEY,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            last_tick_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS target_cursors (
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            cursor_at TEXT NOT NULL,
            PRIMARY KEY (kind, target),
            FOREIGN KEY (kind) REFERENCES simulations(kind)
        );

        CREATE TABLE IF NOT EXISTS outcomes (
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            status INTEGER,
            value REAL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (kind, target, record_id),
            FOREIGN KEY (kind) REFERENCES simulations(kind)
        );

        CREATE TABLE IF NOT EXISTS attempts (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            status INTEGER,
            value REAL,
            elapsed_ms INTEGER,
            detail TEXT,
            attempted_at TEXT NOT NULL,
            FOREIGN KEY (kind) REFERENCES simulations(kind)
        );

        CREATE INDEX IF NOT EXISTS idx_outcomes_target ON outcomes(kind, target);
        CREATE INDEX IF NOT EXISTS idx_attempts_target ON attempts(kind, target);",
    )?;

    // Migration: contact column for targets created before it existed
    let has_email: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('targets') WHERE name='email'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_email == 0 {
        conn.execute("ALTER TABLE targets ADD COLUMN email TEXT", [])?;
    }

    Ok(())
}
