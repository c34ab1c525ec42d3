//! Process configuration.
//!
//! Settings are layered: serde defaults, then an optional YAML/TOML/JSON file, then
//! environment variables prefixed `RESLAYER` with `__` as the nesting separator:
//!
//! ```yaml
//! namespace: "shop"
//! mongodb:
//!   uri: "mongodb://localhost:27017/?replicaSet=rs0"
//!   database: "shop"
//! transaction:
//!   timeout_ms: 30000
//! collections:
//!   orders:
//!     reachable: true
//!     events: true
//!     default_keys: ["number", "total", "status"]
//! ```
//!
//! - `RESLAYER__NAMESPACE=shop`
//! - `RESLAYER__REDIS__URL=redis://cache:6379`
//! - `RESLAYER__TRANSACTION__TIMEOUT_MS=5000`

use std::{collections::HashMap, path::Path, time::Duration};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ResourceError, ResourceResult},
    policy::{CollectionPolicy, PolicyTable},
    secret::FieldCipher,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prefix of staging log keys and event channels.
    pub namespace: String,
    pub logging: LoggingSettings,
    pub mongodb: MongoDbSettings,
    pub redis: RedisSettings,
    pub transaction: TransactionSettings,
    /// Base64 AES-256 key enabling the `cipher` transform.
    pub cipher_key: Option<String>,
    pub collections: HashMap<String, CollectionPolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            namespace: "reslayer".to_string(),
            logging: LoggingSettings::default(),
            mongodb: MongoDbSettings::default(),
            redis: RedisSettings::default(),
            transaction: TransactionSettings::default(),
            cipher_key: None,
            collections: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `pretty`, `compact` or `json`.
    pub format: String,
    /// An `EnvFilter` directive, e.g. `info,reslayer_core=debug`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            format: "compact".to_string(),
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoDbSettings {
    pub uri: String,
    pub database: String,
}

impl Default for MongoDbSettings {
    fn default() -> Self {
        MongoDbSettings {
            uri: "mongodb://localhost:27017".to_string(),
            database: "reslayer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    /// Approximate cap on each event stream's length. `None` keeps every event.
    pub event_stream_max_len: Option<usize>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: "redis://localhost:6379".to_string(),
            event_stream_max_len: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Maximum time from begin to commit.
    pub timeout_ms: u64,
    /// Lifetime of an uncommitted staging log.
    pub ttl_secs: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            timeout_ms: 60_000,
            ttl_secs: 600,
        }
    }
}

impl TransactionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Settings {
    pub fn validate(&self) -> ResourceResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(ResourceError::Configuration("namespace must not be empty".to_string()));
        }
        if self.transaction.timeout_ms == 0 {
            return Err(ResourceError::Configuration(
                "transaction.timeout_ms must be positive".to_string(),
            ));
        }
        if self.transaction.ttl().as_millis() < u128::from(self.transaction.timeout_ms) {
            return Err(ResourceError::Configuration(
                "transaction.ttl_secs must cover transaction.timeout_ms".to_string(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ResourceError::Configuration(format!(
                "unknown logging.format {:?}",
                self.logging.format
            )));
        }
        if let Some(key) = &self.cipher_key {
            FieldCipher::from_base64(key)?;
        }

        Ok(())
    }

    pub fn policy_table(&self) -> PolicyTable {
        self.collections
            .iter()
            .map(|(name, policy)| (name.clone(), policy.clone()))
            .collect()
    }

    pub fn cipher(&self) -> ResourceResult<Option<FieldCipher>> {
        self.cipher_key.as_deref().map(FieldCipher::from_base64).transpose()
    }
}

/// Loads settings from `path` (optional) layered under `RESLAYER__*` environment variables.
pub fn load<P: AsRef<Path>>(path: P) -> ResourceResult<Settings> {
    let settings: Settings = Config::builder()
        .add_source(File::from(path.as_ref()).required(false))
        .add_source(Environment::with_prefix("RESLAYER").separator("__").try_parsing(true))
        .build()
        .and_then(Config::try_deserialize)
        .map_err(|e| ResourceError::Configuration(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}

/// Like [`load`], falling back to defaults when loading fails.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Settings {
    match load(path.as_ref()) {
        Ok(settings) => {
            tracing::info!(path = ?path.as_ref(), "settings loaded");
            settings
        }
        Err(e) => {
            tracing::warn!(path = ?path.as_ref(), error = %e, "failed to load settings, using defaults");
            Settings::default()
        }
    }
}
