//! Error taxonomy for the delivery engine.
//!
//! Only configuration and persistence problems surface as errors. Anything
//! that goes wrong on the wire is classified into an [`crate::outcome::Outcome`]
//! and stored as data instead.

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid setup detected before the tick loop starts (no records, bad
    /// window bounds, unknown simulation kind, malformed record files).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The durable state could not be read or written. Fatal to the current
    /// tick: continuing would risk re-sending delivered records.
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stored state exists but cannot be interpreted.
    #[error("corrupt state for simulation '{kind}': {detail}")]
    CorruptState { kind: String, detail: String },
}

impl SimError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn persistence(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<rusqlite::Error> for SimError {
    fn from(e: rusqlite::Error) -> Self {
        Self::persistence("sqlite", e)
    }
}

impl From<r2d2::Error> for SimError {
    fn from(e: r2d2::Error) -> Self {
        Self::persistence("connection pool", e)
    }
}
