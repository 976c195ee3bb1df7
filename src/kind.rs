//! Simulation kinds and their wire contracts.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SimError};
use crate::records::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationKind {
    /// Sends feature payloads, expects `{"proba": p}` back.
    Observation,
    /// Sends ground-truth labels, expects any JSON acknowledgement.
    TrueOutcome,
}

impl SimulationKind {
    pub const ALL: [SimulationKind; 2] = [SimulationKind::Observation, SimulationKind::TrueOutcome];

    /// Name used as the persisted key of a run.
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationKind::Observation => "observation",
            SimulationKind::TrueOutcome => "true-outcome",
        }
    }

    /// Request body for one record.
    pub fn body(&self, record: &Record) -> Value {
        match self {
            SimulationKind::Observation => json!({
                "id": record.id,
                "observation": record.payload,
            }),
            SimulationKind::TrueOutcome => json!({
                "id": record.id,
                "true_class": record.truth_label,
            }),
        }
    }

    /// Reject record sets this kind cannot deliver.
    pub fn validate(&self, records: &[Record]) -> Result<()> {
        if *self == SimulationKind::TrueOutcome {
            if let Some(r) = records.iter().find(|r| r.truth_label.is_none()) {
                return Err(SimError::config(format!(
                    "record {} has no truth label; true-outcome runs need one on every record",
                    r.id
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for SimulationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SimulationKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "observation" => Ok(SimulationKind::Observation),
            "true-outcome" | "true_outcome" => Ok(SimulationKind::TrueOutcome),
            other => Err(SimError::config(format!("unknown simulation kind '{other}'"))),
        }
    }
}
