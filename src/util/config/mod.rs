//! Runtime configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (EPOCHRT_WORKERS, EPOCHRT_SCHEDULER, EPOCHRT_LOG)
//! 3. Config file (explicit path, or EPOCHRT_CONFIG)
//! 4. Default values
//! ```
//!
//! # Example file
//!
//! ```toml
//! [runtime]
//! node_id = 0
//! registry_shards = 64
//!
//! [scheduler]
//! kind = "work-stealing"
//! num_workers = 8
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::guid::MAX_NODES;
use crate::runtime::scheduler::{SchedulerConfig, SchedulerKind};
use crate::util::logger::LogLevel;

/// Environment variable naming a config file.
pub const ENV_CONFIG: &str = "EPOCHRT_CONFIG";
/// Environment override for the worker count.
pub const ENV_WORKERS: &str = "EPOCHRT_WORKERS";
/// Environment override for the scheduler kind.
pub const ENV_SCHEDULER: &str = "EPOCHRT_SCHEDULER";
/// Environment override for the log level.
pub const ENV_LOG: &str = "EPOCHRT_LOG";

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: CoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[runtime]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Node id embedded in every Guid this runtime allocates.
    #[serde(default)]
    pub node_id: u16,
    /// Number of independently locked registry shards.
    #[serde(default = "default_registry_shards")]
    pub registry_shards: usize,
    /// Largest data object a single create may allocate.
    #[serde(default = "default_max_data_object_bytes")]
    pub max_data_object_bytes: usize,
    /// Keep completed tasks in the registry for inspection.
    #[serde(default)]
    pub retain_completed_tasks: bool,
}

fn default_registry_shards() -> usize {
    64
}

fn default_max_data_object_bytes() -> usize {
    1 << 30
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            registry_shards: default_registry_shards(),
            max_data_object_bytes: default_max_data_object_bytes(),
            retain_completed_tasks: false,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Defaults, then `path` (or the file named by `EPOCHRT_CONFIG`), then
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EPOCHRT_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.scheduler.num_workers = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: ENV_WORKERS,
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup(ENV_SCHEDULER) {
            self.scheduler.kind = value
                .trim()
                .parse::<SchedulerKind>()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: ENV_SCHEDULER,
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.logging.level = value
                .trim()
                .parse::<LogLevel>()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: ENV_LOG,
                    value: value.clone(),
                })?;
        }
        Ok(())
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if u32::from(self.runtime.node_id) >= MAX_NODES {
            return Err(ConfigError::Invalid(format!(
                "node_id {} does not fit in {} nodes",
                self.runtime.node_id, MAX_NODES
            )));
        }
        if self.runtime.registry_shards == 0 {
            return Err(ConfigError::Invalid("registry_shards must be positive".to_string()));
        }
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be positive".to_string()));
        }
        if self.scheduler.steal_batch == 0 {
            return Err(ConfigError::Invalid("steal_batch must be positive".to_string()));
        }
        Ok(())
    }

    /// Builder-style setters used by the CLI layer.
    pub fn with_node(
        mut self,
        node_id: u16,
    ) -> Self {
        self.runtime.node_id = node_id;
        self
    }

    pub fn with_scheduler(
        mut self,
        kind: SchedulerKind,
    ) -> Self {
        self.scheduler.kind = kind;
        self
    }

    pub fn with_workers(
        mut self,
        num_workers: usize,
    ) -> Self {
        self.scheduler.num_workers = num_workers;
        self
    }
}

#[cfg(test)]
mod tests;
