//! Cart configuration, from environment variables or a TOML document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{engine::EngineConfig, runtime::handle::RuntimeConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Every field has a default, so an empty environment or document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    /// Batch gateway base URL. Unset means runs are simulated locally.
    pub api_url: Option<String>,

    /// SQLite file holding the cart (default: `"lecturecart.db"`).
    pub db_path: PathBuf,

    pub persist_debounce_ms: u64,

    /// Per-request timeout for gateway calls, excluding the event stream.
    pub request_timeout_secs: u64,

    pub simulation_stagger_ms: u64,
    pub simulation_cap_ms: u64,

    /// `tracing` filter string, e.g. `"info"` or `"lecturecart=debug"`.
    pub log_level: String,

    /// Emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Default for CartConfig {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        let engine = EngineConfig::default();
        Self {
            api_url: None,
            db_path: PathBuf::from("lecturecart.db"),
            persist_debounce_ms: runtime.persist_debounce_ms,
            request_timeout_secs: 30,
            simulation_stagger_ms: engine.simulation_stagger_ms,
            simulation_cap_ms: engine.simulation_cap_ms,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl CartConfig {
    /// Build [`CartConfig`] from `LECTURECART_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlays every `LECTURECART_*` variable that is set onto `self`.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlays variables from `lookup`; unset or unparsable values keep the current field.
    pub fn with_vars<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LECTURECART_API_URL") {
            self.api_url = Some(url).filter(|v| !v.trim().is_empty());
        }
        if let Some(path) = lookup("LECTURECART_DB") {
            self.db_path = PathBuf::from(path);
        }
        self.persist_debounce_ms = parse_var(
            &lookup,
            "LECTURECART_PERSIST_DEBOUNCE_MS",
            self.persist_debounce_ms,
        );
        self.request_timeout_secs = parse_var(
            &lookup,
            "LECTURECART_REQUEST_TIMEOUT_SECS",
            self.request_timeout_secs,
        );
        if let Some(level) = lookup("LECTURECART_LOG") {
            self.log_level = level;
        }
        if let Some(json) = lookup("LECTURECART_LOG_JSON") {
            self.log_json = json == "1" || json.eq_ignore_ascii_case("true");
        }
        self
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            persist_debounce_ms: self.persist_debounce_ms,
            ..RuntimeConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            simulation_stagger_ms: self.simulation_stagger_ms,
            simulation_cap_ms: self.simulation_cap_ms,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, current: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}
