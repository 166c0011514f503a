use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// `postgres://…`, `sqlite:…` or `memory:`
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Fixed number of writers, each holding its own transaction.
    #[serde(default = "default_workers")]
    pub workers: i64,
    /// Rows a writer accumulates before it forces a commit.
    #[serde(default = "default_commit_size")]
    pub commit_size: usize,
    pub table_name: String,
    /// Values per row; chunks must carry a multiple of this.
    pub columns: usize,
    /// Pause after a writer fails to prepare a statement.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Rows per chunk.
    pub batch_size: usize,
    #[serde(default)]
    pub has_headers: bool,
    #[serde(default)]
    pub stream_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReporterConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_workers() -> i64 {
    1
}

fn default_commit_size() -> usize {
    10_000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_delimiter() -> char {
    ','
}

fn default_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ReporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl EngineConfig {
    pub fn new(table_name: impl Into<String>, columns: usize) -> Self {
        Self {
            workers: default_workers(),
            commit_size: default_commit_size(),
            table_name: table_name.into(),
            columns,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    pub fn with_workers(mut self, workers: i64) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_commit_size(mut self, commit_size: usize) -> Self {
        self.commit_size = commit_size;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Worker count with anything below one raised to one.
    pub fn worker_count(&self) -> usize {
        if self.workers <= 0 {
            1
        } else {
            self.workers as usize
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.columns == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "column count must be at least 1".to_string(),
            });
        }
        if self.table_name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "engine.table_name".to_string(),
            });
        }
        if !is_table_name(&self.table_name) {
            return Err(ConfigError::Invalid {
                message: format!("'{}' is not a valid table name", self.table_name),
            });
        }
        Ok(())
    }
}

/// Plain or schema-qualified identifiers, optionally double-quoted.
fn is_table_name(name: &str) -> bool {
    name.split('.').all(|part| {
        let bare = part
            .strip_prefix('"')
            .and_then(|p| p.strip_suffix('"'))
            .unwrap_or(part);
        !bare.is_empty()
            && !bare.contains('"')
            && bare
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || (c == ' ' && bare.len() < part.len()))
    })
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    match config_path {
        Some(path) => IngestConfig::from_file(path),
        None => IngestConfig::from_env(),
    }
}

impl IngestConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let load_failed = |error: Box<dyn std::error::Error + Send + Sync>| ConfigError::LoadFailed {
            origin: path.to_string(),
            error,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_failed(e.into()))?;
        let config: IngestConfig =
            serde_yaml::from_str(&content).map_err(|e| load_failed(e.into()))?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("INGEST_CONFIG environment variable not set"))?;
        let config: IngestConfig =
            serde_yaml::from_str(&config_str).map_err(|e| ConfigError::LoadFailed {
                origin: "INGEST_CONFIG".to_string(),
                error: e.into(),
            })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.url".to_string(),
            });
        }
        if self.database.max_connections == Some(0) {
            return Err(ConfigError::ValidationFailed {
                reason: "database.max_connections must be at least 1".to_string(),
            });
        }
        self.engine.validate()?;
        if self.source.path.is_empty() {
            return Err(ConfigError::MissingField {
                field: "source.path".to_string(),
            });
        }
        if self.source.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "source.batch_size must be at least 1".to_string(),
            });
        }
        if !self.source.delimiter.is_ascii() {
            return Err(ConfigError::Invalid {
                message: format!("delimiter '{}' is not ASCII", self.source.delimiter),
            });
        }
        if self.reporter.enabled && self.reporter.interval_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "reporter.interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}
