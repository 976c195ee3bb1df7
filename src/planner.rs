//! Deadline planner: spreads records evenly across the delivery window.
//!
//! `due_at(i) = start + i * (end - start) / n`, computed in integer
//! nanoseconds so the result is identical on every recomputation.

use std::ops::Bound;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SimError};
use crate::records::Record;

/// Half-open delivery window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(SimError::config(format!(
                "window end {end} must be after window start {start}"
            )));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// 0-based position of the record in load order.
    pub index: usize,
    pub record_id: i64,
    pub due_at: DateTime<Utc>,
}

/// Deadlines for one run, sorted by `due_at`.
#[derive(Debug, Clone)]
pub struct Schedule {
    window: Window,
    deadlines: Vec<Deadline>,
}

impl Schedule {
    pub fn window(&self) -> Window {
        self.window
    }

    pub fn deadlines(&self) -> &[Deadline] {
        &self.deadlines
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Deadlines with `lower < due_at <= upper` (or `lower <= due_at` for an
    /// inclusive lower bound).
    pub fn due_between(&self, lower: Bound<DateTime<Utc>>, upper: DateTime<Utc>) -> &[Deadline] {
        let from = match lower {
            Bound::Included(t) => self.deadlines.partition_point(|d| d.due_at < t),
            Bound::Excluded(t) => self.deadlines.partition_point(|d| d.due_at <= t),
            Bound::Unbounded => 0,
        };
        let to = self.deadlines.partition_point(|d| d.due_at <= upper);
        if from >= to {
            &[]
        } else {
            &self.deadlines[from..to]
        }
    }
}

/// Compute one deadline per record.
///
/// Fails with a configuration error for an empty record list, or when the
/// window is too short to give every record a distinct nanosecond.
pub fn plan(records: &[Record], window: Window) -> Result<Schedule> {
    let n = records.len();
    if n == 0 {
        return Err(SimError::config("no records to deliver"));
    }

    let span = (window.end - window.start)
        .num_nanoseconds()
        .ok_or_else(|| SimError::config("delivery window is too long"))?;
    if span < n as i64 {
        return Err(SimError::config(format!(
            "window of {span}ns cannot hold {n} distinct deadlines"
        )));
    }

    let deadlines = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let offset = (index as i128 * span as i128 / n as i128) as i64;
            Deadline {
                index,
                record_id: record.id,
                due_at: window.start + Duration::nanoseconds(offset),
            }
        })
        .collect();

    Ok(Schedule { window, deadlines })
}
