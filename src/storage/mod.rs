//! SQLite storage layer -- schema, target registry, run progress, history.

pub mod history;
pub mod progress;
pub mod schema;
pub mod targets;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{Result, SimError};

pub use progress::{ProgressStore, RunState};
pub use targets::{Target, TargetRegistry};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            SimError::persistence(format!("cannot create {}", parent.display()), e)
        })?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder().max_size(4).build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    tracing::debug!(path = %path.display(), "database ready");
    Ok(pool)
}

/// Timestamps are stored as RFC 3339 with nanoseconds so that deadlines
/// recomputed from a reloaded `window_start` match the original ones.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(kind: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SimError::CorruptState {
            kind: kind.to_string(),
            detail: format!("bad timestamp '{raw}': {e}"),
        })
}
