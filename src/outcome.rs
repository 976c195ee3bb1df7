//! Durable delivery outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value exported for every pair without a successful delivery. Never a
/// valid probability, so downstream scoring can tell it apart.
pub const FAILURE_SENTINEL: f64 = -1.0;

/// What a target handed back on a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivered {
    /// Prediction endpoints answer with a probability in `[0, 1]`.
    Probability { proba: f64 },
    /// Ground-truth endpoints only acknowledge; the HTTP status is echoed.
    Acknowledged { status: u16 },
}

impl Delivered {
    pub fn value(&self) -> f64 {
        match self {
            Delivered::Probability { proba } => *proba,
            Delivered::Acknowledged { status } => f64::from(*status),
        }
    }
}

/// Classified result of delivering one record to one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success(Delivered),
    HttpError(u16),
    Timeout,
    ConnectionFailure,
    DecodeError,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Stable label, used as the stored discriminant.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::HttpError(_) => "http_error",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionFailure => "connection_failure",
            Outcome::DecodeError => "decode_error",
        }
    }

    /// HTTP status associated with the outcome, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Outcome::Success(Delivered::Acknowledged { status }) => Some(*status),
            Outcome::HttpError(status) => Some(*status),
            _ => None,
        }
    }

    /// Value in the exported state layout: the delivered value, or
    /// [`FAILURE_SENTINEL`].
    pub fn export_value(&self) -> f64 {
        match self {
            Outcome::Success(delivered) => delivered.value(),
            _ => FAILURE_SENTINEL,
        }
    }

    /// Split into `(outcome, status, value)` columns.
    pub(crate) fn to_columns(self) -> (&'static str, Option<i64>, Option<f64>) {
        let value = match self {
            Outcome::Success(Delivered::Probability { proba }) => Some(proba),
            _ => None,
        };
        (self.label(), self.status().map(i64::from), value)
    }

    /// Inverse of [`Outcome::to_columns`]. `None` for rows that don't
    /// describe a valid outcome.
    pub(crate) fn from_columns(label: &str, status: Option<i64>, value: Option<f64>) -> Option<Self> {
        let status = match status {
            Some(s) => Some(u16::try_from(s).ok()?),
            None => None,
        };
        match (label, status, value) {
            ("success", _, Some(proba)) => Some(Outcome::Success(Delivered::Probability { proba })),
            ("success", Some(status), None) => {
                Some(Outcome::Success(Delivered::Acknowledged { status }))
            }
            ("http_error", Some(status), _) => Some(Outcome::HttpError(status)),
            ("timeout", _, _) => Some(Outcome::Timeout),
            ("connection_failure", _, _) => Some(Outcome::ConnectionFailure),
            ("decode_error", _, _) => Some(Outcome::DecodeError),
            _ => None,
        }
    }
}

/// One dispatch attempt as appended to the attempt history.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub target: String,
    pub record_id: i64,
    pub outcome: Outcome,
    pub elapsed: Option<Duration>,
    /// Transport error or body excerpt for non-success outcomes.
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(Delivered::Probability { proba }) => write!(f, "success(proba={proba})"),
            Outcome::Success(Delivered::Acknowledged { status }) => write!(f, "success({status})"),
            Outcome::HttpError(status) => write!(f, "http_error({status})"),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_exports_a_value() {
        let ok = Outcome::Success(Delivered::Probability { proba: 0.7 });
        assert_eq!(ok.export_value(), 0.7);
        assert_eq!(Outcome::HttpError(500).export_value(), FAILURE_SENTINEL);
        assert_eq!(Outcome::Timeout.export_value(), FAILURE_SENTINEL);
        assert_eq!(Outcome::DecodeError.export_value(), FAILURE_SENTINEL);
    }

    #[test]
    fn test_columns_preserve_variant() {
        let cases = [
            Outcome::Success(Delivered::Probability { proba: 0.0 }),
            Outcome::Success(Delivered::Acknowledged { status: 201 }),
            Outcome::HttpError(503),
            Outcome::Timeout,
            Outcome::ConnectionFailure,
            Outcome::DecodeError,
        ];
        for outcome in cases {
            let (label, status, value) = outcome.to_columns();
            assert_eq!(Outcome::from_columns(label, status, value), Some(outcome));
        }
    }

    #[test]
    fn test_unknown_label_is_rejected() {
        assert_eq!(Outcome::from_columns("exploded", None, None), None);
        assert_eq!(Outcome::from_columns("http_error", None, None), None);
        assert_eq!(Outcome::from_columns("http_error", Some(70_000), None), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Outcome::HttpError(404).to_string(), "http_error(404)");
        assert_eq!(Outcome::ConnectionFailure.to_string(), "connection_failure");
    }
}
