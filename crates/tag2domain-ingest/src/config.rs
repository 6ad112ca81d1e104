//! Configuration file.
//!
//! ```yaml
//! database:
//!   url: postgres://tag2domain@localhost/tag2domain
//!   pool:
//!     max_connections: 2
//!     connect_timeout_secs: 10
//! tag2domain:
//!   max_measurement_age_minutes: 1440
//! logging:
//!   level: info
//!   format: json
//!   file: /var/log/tag2domain/msm2tag2domain.log
//! retry:
//!   max_attempts: 5
//!   backoff_ms: 500
//! intersection_tables:
//!   domain:
//!     table_name: domain_tags
//!     id: domain_id
//!     # ... every column key is required
//! ```
//!
//! `DATABASE_URL` overrides `database.url`; `LOG_FORMAT`, `LOG_FILE` and
//! `LOG_ANSI` override the logging section.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use tag2domain_core::defaults::{
    INGEST_MAX_CONNECTIONS, MAX_MEASUREMENT_AGE_MINUTES, RETRY_BACKOFF_MS, RETRY_MAX_ATTEMPTS,
};
use tag2domain_core::{Error, Result};
use tag2domain_db::{IntersectionTables, PoolConfig};
use tag2domain_msm::FreshnessGuard;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tag2domain: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Defaults to the tables of the bundled migrations.
    #[serde(default)]
    pub intersection_tables: Option<IntersectionTables>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "ingest_pool")]
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool: ingest_pool(),
        }
    }
}

/// Measurements are handled one at a time, so a small pool suffices.
fn ingest_pool() -> PoolConfig {
    PoolConfig::new().max_connections(INGEST_MAX_CONNECTIONS)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_max_age")]
    pub max_measurement_age_minutes: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_measurement_age_minutes: default_max_age(),
        }
    }
}

fn default_max_age() -> Option<i64> {
    MAX_MEASUREMENT_AGE_MINUTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub ansi: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: None,
            ansi: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            backoff_ms: RETRY_BACKOFF_MS,
        }
    }
}

fn default_max_attempts() -> u32 {
    RETRY_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    RETRY_BACKOFF_MS
}

impl Config {
    /// Read, parse and validate a config file, then apply environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("could not read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&text)?.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty file is a valid, all-default config.
        if text.trim().is_empty() {
            return Self::from_yaml("{}");
        }
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Apply environment overrides read through `env`.
    pub fn with_overrides(mut self, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = env("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(format) = env("LOG_FORMAT") {
            self.logging.format = match format.as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(Error::Config(format!(
                        "LOG_FORMAT must be 'json' or 'text', got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(file) = env("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
        if let Some(ansi) = env("LOG_ANSI") {
            self.logging.ansi = Some(ansi == "true" || ansi == "1");
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(
                "no database URL: set database.url or DATABASE_URL".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if let Some(minutes) = self.tag2domain.max_measurement_age_minutes {
            if minutes <= 0 {
                return Err(Error::Config(format!(
                    "tag2domain.max_measurement_age_minutes must be positive, got {}",
                    minutes
                )));
            }
        }
        FreshnessGuard::from_minutes(self.tag2domain.max_measurement_age_minutes)?;
        self.tables().validate()
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("no database URL configured".to_string()))
    }

    pub fn tables(&self) -> IntersectionTables {
        self.intersection_tables.clone().unwrap_or_default()
    }
}
