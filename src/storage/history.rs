//! Append-only attempt history and the read-side queries built on it.

use rusqlite::{params, Connection};
use serde::Serialize;

use super::{fmt_ts, Pool};
use crate::error::Result;
use crate::outcome::Attempt;

/// Longest stored error detail; bodies of misbehaving endpoints can be huge.
const MAX_DETAIL_CHARS: usize = 512;

/// Append attempts. Called inside the progress save transaction.
pub(crate) fn insert_attempts(conn: &Connection, kind: &str, attempts: &[Attempt]) -> Result<()> {
    if attempts.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT INTO attempts (kind, target, record_id, outcome, status, value, elapsed_ms, detail, attempted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for a in attempts {
        let (label, status, value) = a.outcome.to_columns();
        let elapsed_ms = a.elapsed.map(|d| d.as_millis() as i64);
        let detail = a
            .detail
            .as_deref()
            .map(|d| d.chars().take(MAX_DETAIL_CHARS).collect::<String>());
        stmt.execute(params![
            kind,
            a.target,
            a.record_id,
            label,
            status,
            value,
            elapsed_ms,
            detail,
            fmt_ts(a.attempted_at)
        ])?;
    }
    Ok(())
}

/// Attempt count per target, outcome and HTTP status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub target: String,
    pub outcome: String,
    pub status: Option<u16>,
    pub count: u64,
}

pub fn status_counts(pool: &Pool, kind: &str) -> Result<Vec<StatusCount>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT target, outcome, status, COUNT(*) FROM attempts
         WHERE kind = ?1
         GROUP BY target, outcome, status
         ORDER BY target, outcome, status",
    )?;
    let rows = stmt.query_map(params![kind], |row| {
        Ok(StatusCount {
            target: row.get(0)?,
            outcome: row.get(1)?,
            status: row.get::<_, Option<i64>>(2)?.and_then(|s| u16::try_from(s).ok()),
            count: row.get::<_, i64>(3)? as u64,
        })
    })?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?);
    }
    Ok(list)
}

/// A pair whose stored outcome is not a success, with the most recent
/// error detail from the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedPair {
    pub target: String,
    pub record_id: i64,
    pub outcome: String,
    pub status: Option<u16>,
    pub detail: Option<String>,
}

/// Up to `per_target` failed pairs for each target, lowest record id first.
pub fn failed_pairs(pool: &Pool, kind: &str, per_target: usize) -> Result<Vec<FailedPair>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT o.target, o.record_id, o.outcome, o.status,
                (SELECT a.detail FROM attempts a
                  WHERE a.kind = o.kind AND a.target = o.target AND a.record_id = o.record_id
                  ORDER BY a.id DESC LIMIT 1)
         FROM outcomes o
         WHERE o.kind = ?1 AND o.outcome != 'success'
         ORDER BY o.target, o.record_id",
    )?;
    let rows = stmt.query_map(params![kind], |row| {
        Ok(FailedPair {
            target: row.get(0)?,
            record_id: row.get(1)?,
            outcome: row.get(2)?,
            status: row.get::<_, Option<i64>>(3)?.and_then(|s| u16::try_from(s).ok()),
            detail: row.get(4)?,
        })
    })?;

    let mut list: Vec<FailedPair> = Vec::new();
    let mut taken = 0;
    for r in rows {
        let pair = r?;
        if list.last().map(|p| p.target != pair.target).unwrap_or(true) {
            taken = 0;
        }
        if taken < per_target {
            taken += 1;
            list.push(pair);
        }
    }
    Ok(list)
}
