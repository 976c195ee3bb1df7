//! Read-only views of a run for operators and the scoring stage.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{Result, SimError};
use crate::kind::SimulationKind;
use crate::storage::{Pool, ProgressStore, RunState};

/// Persisted layout handed to scoring: one value per (target, record),
/// `-1` for anything that was not delivered successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateExport {
    pub kind: SimulationKind,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_tick_time: Option<DateTime<Utc>>,
    pub outcomes: BTreeMap<String, BTreeMap<i64, f64>>,
}

impl StateExport {
    pub fn from_state(state: &RunState) -> Self {
        let outcomes = state
            .target_names()
            .map(|target| {
                let values = state
                    .outcomes(target)
                    .map(|table| {
                        table
                            .iter()
                            .map(|(id, outcome)| (*id, outcome.export_value()))
                            .collect()
                    })
                    .unwrap_or_default();
                (target.to_string(), values)
            })
            .collect();

        Self {
            kind: state.kind(),
            window_start: state.window().start,
            window_end: state.window().end,
            last_tick_time: state.last_tick_time(),
            outcomes,
        }
    }
}

/// Load the stored run for `kind` without creating one.
pub fn load_existing(pool: &Pool, kind: SimulationKind) -> Result<RunState> {
    let store = ProgressStore::new(pool.clone());
    if !store.exists(kind)? {
        return Err(SimError::config(format!("no stored run for simulation '{kind}'")));
    }
    store.load(kind, &[], None, Utc::now())
}

/// Write `export` as JSON to `path`. The file is written next to its
/// destination and renamed into place, so readers never see a partial file.
pub fn write_export(export: &StateExport, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SimError::persistence(format!("cannot stage export in {}", dir.display()), e))?;

    serde_json::to_writer_pretty(&mut tmp, export)
        .map_err(|e| SimError::persistence("cannot serialize export", e))?;
    tmp.write_all(b"\n")
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| SimError::persistence("cannot flush export", e))?;
    tmp.persist(path)
        .map_err(|e| SimError::persistence(format!("cannot replace {}", path.display()), e.error))?;

    info!(path = %path.display(), targets = export.outcomes.len(), "state exported");
    Ok(())
}
