//! Store configuration
//!
//! Supports loading settings from (in order of priority):
//! 1. An explicit JSON file
//! 2. JSON file in the config directory (~/.config/mailstore/mailstore.json)
//! 3. Runtime environment variables
//! 4. Built-in defaults

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Config filename in the mailstore config directory
const CONFIG_FILE: &str = "mailstore.json";

/// Rows fetched per page by scans
pub const DEFAULT_QUERY_BATCH_SIZE: usize = 5000;

/// UIDs sent in a single `IN (...)` predicate
pub const DEFAULT_IN_CLAUSE_MAX_SIZE: usize = 1000;

/// Change log retention: 60 days
pub const DEFAULT_CHANGE_TTL_SECS: u64 = 60 * 24 * 60 * 60;

const ENV_BACKEND: &str = "MAILSTORE_BACKEND";
const ENV_DB_PATH: &str = "MAILSTORE_DB_PATH";

/// Which storage backend to open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => bail!("Unknown backend '{}' (expected 'memory' or 'sqlite')", other),
        }
    }
}

/// Settings of the mailbox store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Database file, required by the SQLite backend
    pub database_path: Option<PathBuf>,
    pub query_batch_size: usize,
    pub in_clause_max_size: usize,
    /// `None` keeps change records forever
    pub change_ttl_secs: Option<u64>,
    pub operation_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_path: None,
            query_batch_size: DEFAULT_QUERY_BATCH_SIZE,
            in_clause_max_size: DEFAULT_IN_CLAUSE_MAX_SIZE,
            change_ttl_secs: Some(DEFAULT_CHANGE_TTL_SECS),
            operation_timeout_ms: 5000,
            health_check_timeout_ms: 1000,
        }
    }
}

impl StoreConfig {
    /// Load the configuration using the following priority:
    /// 1. JSON file (~/.config/mailstore/mailstore.json)
    /// 2. Runtime environment variables over the defaults
    pub fn load() -> Result<Self> {
        let config = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, after validating it
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;
        config::save_json_file(path, self)
    }

    /// Parse the configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse store config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MAILSTORE_BACKEND` and `MAILSTORE_DB_PATH`
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.backend = backend
                .parse()
                .with_context(|| format!("Invalid {}", ENV_BACKEND))?;
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    /// Get the default config file path (~/.config/mailstore/mailstore.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }

    /// Reject settings no backend can run with
    pub fn validate(&self) -> Result<()> {
        if self.query_batch_size == 0 {
            bail!("query_batch_size must be greater than zero");
        }
        if self.in_clause_max_size == 0 {
            bail!("in_clause_max_size must be greater than zero");
        }
        if self.backend == BackendKind::Sqlite && self.database_path.is_none() {
            bail!("The sqlite backend requires database_path");
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Retention window of change records
    pub fn change_retention(&self) -> Option<chrono::Duration> {
        self.change_ttl_secs.map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX)
        })
    }
}
