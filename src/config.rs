//! TOML configuration for simdispatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file) is a
//! valid configuration. Lookup order: explicit `--config` path, the
//! `SIMDISPATCH_CONFIG` environment variable, `./simdispatch.toml`, defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SimError;
use crate::kind::SimulationKind;

/// Placeholder substituted with the target name in endpoint templates.
pub const TARGET_PLACEHOLDER: &str = "{target}";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulations: SimulationsConfig,
}

impl SimConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the
    /// environment and working-directory candidates fall through on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("SIMDISPATCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SIMDISPATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("simdispatch.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(error = %e, "simdispatch.toml exists but could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check the values that would make a run meaningless.
    pub fn validate(&self) -> crate::error::Result<()> {
        let d = &self.dispatch;
        if d.max_in_flight == 0 {
            return Err(SimError::config("dispatch.max_in_flight must be at least 1"));
        }
        if d.request_timeout_secs == 0 {
            return Err(SimError::config("dispatch.request_timeout_secs must be at least 1"));
        }
        if d.poll_interval_ms == 0 {
            return Err(SimError::config("dispatch.poll_interval_ms must be at least 1"));
        }
        for kind in SimulationKind::ALL {
            let sim = self.simulation(kind);
            if !sim.endpoint_template.contains(TARGET_PLACEHOLDER) {
                return Err(SimError::config(format!(
                    "simulations.{}.endpoint_template must contain {TARGET_PLACEHOLDER}",
                    kind.as_str().replace('-', "_")
                )));
            }
        }
        Ok(())
    }

    pub fn simulation(&self, kind: SimulationKind) -> &SimulationConfig {
        match kind {
            SimulationKind::Observation => &self.simulations.observation,
            SimulationKind::TrueOutcome => &self.simulations.true_outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding targets, run state and attempt history.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/simdispatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Scheduler cadence and outbound limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on concurrent in-flight requests within a tick.
    pub max_in_flight: usize,
    /// Per-request timeout (seconds).
    pub request_timeout_secs: u64,
    /// Delay between ticks (milliseconds).
    pub poll_interval_ms: u64,
    /// Oldest deadline age still eligible for delivery after downtime (seconds).
    pub max_catchup_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 50,
            request_timeout_secs: 30,
            poll_interval_ms: 1000,
            max_catchup_secs: 3600,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Capped at ten years; anything longer behaves as "no bound".
    pub fn max_catchup(&self) -> chrono::Duration {
        const CAP_SECS: u64 = 10 * 365 * 86_400;
        chrono::Duration::seconds(self.max_catchup_secs.min(CAP_SECS) as i64)
    }
}

// ---------------------------------------------------------------------------
// Simulations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationsConfig {
    pub observation: SimulationConfig,
    pub true_outcome: SimulationConfig,
}

impl Default for SimulationsConfig {
    fn default() -> Self {
        Self {
            observation: SimulationConfig {
                endpoint_template: "https://{target}.herokuapp.com/predict".to_string(),
                record_files: vec![PathBuf::from("X_test_1.jsonl"), PathBuf::from("X_test_2.jsonl")],
                label_field: "true_outcome".to_string(),
            },
            true_outcome: SimulationConfig {
                endpoint_template: "https://{target}.herokuapp.com/update".to_string(),
                record_files: vec![PathBuf::from("y_test_1.jsonl")],
                label_field: "true_outcome".to_string(),
            },
        }
    }
}

/// Per-kind endpoint and record source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// URL template; `{target}` is replaced with the target name.
    pub endpoint_template: String,
    /// JSON Lines record files, concatenated in order.
    pub record_files: Vec<PathBuf>,
    /// Field lifted out of each record as its truth label.
    pub label_field: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            endpoint_template: "https://{target}.herokuapp.com/predict".to_string(),
            record_files: Vec::new(),
            label_field: "true_outcome".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (`trace` .. `error`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SimConfig::default();

        assert_eq!(cfg.storage.db_path, PathBuf::from("data/simdispatch.db"));
        assert_eq!(cfg.dispatch.max_in_flight, 50);
        assert_eq!(cfg.dispatch.request_timeout_secs, 30);
        assert_eq!(cfg.dispatch.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.dispatch.max_catchup(), chrono::Duration::hours(1));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert_eq!(
            cfg.simulations.true_outcome.endpoint_template,
            "https://{target}.herokuapp.com/update"
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg: SimConfig = toml::from_str(
            r#"
[dispatch]
max_in_flight = 8

[simulations.observation]
endpoint_template = "http://127.0.0.1:9000/{target}/predict"
"#,
        )
        .unwrap();

        assert_eq!(cfg.dispatch.max_in_flight, 8);
        assert_eq!(cfg.dispatch.request_timeout_secs, 30);
        assert_eq!(
            cfg.simulation(SimulationKind::Observation).endpoint_template,
            "http://127.0.0.1:9000/{target}/predict"
        );
        assert_eq!(cfg.simulations.observation.label_field, "true_outcome");
        assert_eq!(
            cfg.simulations.true_outcome.endpoint_template,
            "https://{target}.herokuapp.com/update"
        );
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: SimConfig = toml::from_str("").unwrap();
        let defaults = SimConfig::default();
        assert_eq!(cfg.storage.db_path, defaults.storage.db_path);
        assert_eq!(cfg.dispatch.max_catchup_secs, defaults.dispatch.max_catchup_secs);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut cfg = SimConfig::default();
        cfg.dispatch.max_in_flight = 0;
        assert!(matches!(cfg.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_template_without_placeholder() {
        let mut cfg = SimConfig::default();
        cfg.simulations.true_outcome.endpoint_template = "https://example.com/update".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("simulations.true_outcome"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("simdispatch.toml");
        std::fs::write(
            &path,
            r#"
[logging]
format = "json"
"#,
        )
        .unwrap();

        let cfg = SimConfig::load(&path).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(SimConfig::load(Path::new("/nonexistent/simdispatch.toml")).is_err());
        assert!(SimConfig::resolve(Some(Path::new("/nonexistent/simdispatch.toml"))).is_err());
    }
}
