//! Response classifier: raw network result -> durable [`Outcome`].

use serde::Deserialize;

use super::RawResponse;
use crate::kind::SimulationKind;
use crate::outcome::{Delivered, Outcome};

const BODY_EXCERPT_CHARS: usize = 200;

#[derive(Deserialize)]
struct Prediction {
    proba: f64,
}

/// Classify one attempt. Returns the outcome and, for non-success
/// outcomes, a short detail for the attempt history.
pub fn classify(kind: SimulationKind, raw: &RawResponse) -> (Outcome, Option<String>) {
    match raw {
        RawResponse::Failed { timed_out: true, detail } => (Outcome::Timeout, Some(detail.clone())),
        RawResponse::Failed { detail, .. } => (Outcome::ConnectionFailure, Some(detail.clone())),
        RawResponse::Received { status, body } if !(200..300).contains(status) => {
            (Outcome::HttpError(*status), Some(excerpt(body)))
        }
        RawResponse::Received { status, body } => match kind {
            SimulationKind::Observation => match serde_json::from_slice::<Prediction>(body) {
                Ok(p) if (0.0..=1.0).contains(&p.proba) => (
                    Outcome::Success(Delivered::Probability { proba: p.proba }),
                    None,
                ),
                Ok(p) => (
                    Outcome::DecodeError,
                    Some(format!("proba {} outside [0, 1]", p.proba)),
                ),
                Err(e) => (Outcome::DecodeError, Some(format!("{e}: {}", excerpt(body)))),
            },
            SimulationKind::TrueOutcome => match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(_) => (
                    Outcome::Success(Delivered::Acknowledged { status: *status }),
                    None,
                ),
                Err(e) => (Outcome::DecodeError, Some(format!("{e}: {}", excerpt(body)))),
            },
        },
    }
}

fn excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(BODY_EXCERPT_CHARS).collect()
}
