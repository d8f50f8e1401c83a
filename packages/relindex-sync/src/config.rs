//! Service configuration
//!
//! Loaded from YAML (`version: 1` schema) or assembled in code:
//!
//! ```yaml
//! version: 1
//! service_id: recordwithrelations
//! record_type: recordwithrelations
//! relations:
//!   mock-records: [inner_record]
//! batch_limit: 100
//! notification_failure: isolate
//! indexer:
//!   bulk_chunk_size: 500
//!   max_attempts: 3
//! ```
//!
//! Relation paths are dotted and relative to the record metadata root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", .supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// What the record service does when a relation subscriber fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationFailurePolicy {
    /// Log and return the committed result
    #[default]
    Isolate,
    /// Return the delivery error to the caller (the store commit stands)
    Propagate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Queue entries claimed and written per bulk request
    pub bulk_chunk_size: usize,
    /// Attempts before a failing entry is dead-lettered
    pub max_attempts: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            bulk_chunk_size: 500,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Relation levels dereferenced on read: 1 = direct relations only,
    /// 2 = direct relations and their own relations
    pub max_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_depth: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_size: usize,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_size: 25,
            max_results: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Record service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub version: Option<u32>,
    pub service_id: String,
    pub record_type: String,
    /// Referenced record type -> metadata paths holding stubs of that type
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<String>>,
    /// Maximum disjunctive clauses per relation reindex query
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default)]
    pub notification_failure: NotificationFailurePolicy,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_batch_limit() -> usize {
    100
}

impl SyncConfig {
    pub fn new(service_id: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            version: Some(1),
            service_id: service_id.into(),
            record_type: record_type.into(),
            relations: BTreeMap::new(),
            batch_limit: default_batch_limit(),
            notification_failure: NotificationFailurePolicy::default(),
            indexer: IndexerConfig::default(),
            resolver: ResolverConfig::default(),
            search: SearchConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    /// Declare that `paths` hold stubs referencing records of `relation_type`
    pub fn with_relation<I, S>(mut self, relation_type: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations
            .entry(relation_type.into())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn with_notification_failure(mut self, policy: NotificationFailurePolicy) -> Self {
        self.notification_failure = policy;
        self
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: SyncConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        match self.version {
            None => return Err(ConfigError::MissingVersion),
            Some(v) if !SUPPORTED_VERSIONS.contains(&v) => {
                return Err(ConfigError::UnsupportedVersion {
                    found: v,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }

        if self.service_id.trim().is_empty() {
            return Err(ConfigError::Invalid("service_id must not be empty".into()));
        }
        if self.record_type.trim().is_empty() {
            return Err(ConfigError::Invalid("record_type must not be empty".into()));
        }

        check_range("batch_limit", self.batch_limit, 1, 10_000)?;
        check_range("indexer.bulk_chunk_size", self.indexer.bulk_chunk_size, 1, 100_000)?;
        check_range("indexer.max_attempts", self.indexer.max_attempts as usize, 1, 100)?;
        check_range("resolver.max_depth", self.resolver.max_depth, 0, 8)?;
        check_range(
            "search.max_results",
            self.search.max_results,
            1,
            usize::MAX,
        )?;
        check_range(
            "search.default_size",
            self.search.default_size,
            1,
            self.search.max_results,
        )?;
        check_range("worker.interval_ms", self.worker.interval_ms as usize, 1, usize::MAX)?;

        for (relation_type, paths) in &self.relations {
            if paths.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "relation '{}' declares no paths",
                    relation_type
                )));
            }
            if let Some(bad) = paths
                .iter()
                .find(|p| p.is_empty() || p.split('.').any(str::is_empty))
            {
                return Err(ConfigError::Invalid(format!(
                    "relation '{}' has malformed path '{}'",
                    relation_type, bad
                )));
            }
        }

        Ok(())
    }
}

fn check_range(field: &str, value: usize, min: usize, max: usize) -> ConfigResult<()> {
    if value < min || value > max {
        return Err(ConfigError::Range {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(())
}
