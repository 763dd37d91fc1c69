//! TOML configuration for the planner and the scheduler.
//!
//! ```toml
//! [planner]
//! max_rewrite_passes = 100
//! memory_budget_bytes = 67108864
//!
//! [execution]
//! max_workers = 4
//! channel_capacity = 64
//!
//! [cost]
//! wio = 0.4
//! wcpu = 0.4
//! wmemory = 0.1
//! waccuracy = 0.1
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::cost::CostPolicy;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "TESSERA_CONFIG";

/// Order in which the rewrite driver visits nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrder {
    /// Parents before children.
    #[default]
    TopDown,
    /// Children before parents.
    BottomUp,
}

/// Planner settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum number of full rewrite passes before planning fails.
    pub max_rewrite_passes: usize,
    /// Number of physical plans kept in the plan cache.
    pub plan_cache_size: usize,
    /// Memory an in-memory sort may use before it is replaced by an external
    /// sort.
    pub memory_budget_bytes: u64,
    /// Minimum operand width for vectorised function variants.
    pub vectorisation_threshold: usize,
    /// Traversal order of the rewrite driver.
    pub match_order: MatchOrder,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_rewrite_passes: 100,
            plan_cache_size: 100,
            memory_budget_bytes: 64 * 1024 * 1024,
            vectorisation_threshold: 16,
            match_order: MatchOrder::TopDown,
        }
    }
}

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running worker groups.
    pub max_workers: usize,
    /// Capacity of the bounded channel between a worker group and its consumer.
    pub channel_capacity: usize,
    /// Directory for external sort spill files; system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            channel_capacity: 64,
            spill_dir: None,
        }
    }
}

/// Complete configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Planner section.
    pub planner: PlannerConfig,
    /// Execution section.
    pub execution: ExecutionConfig,
    /// Default cost policy used when a query carries no policy hint.
    pub cost: CostPolicy,
}

impl QueryConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: QueryConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: None,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: QueryConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by [`CONFIG_ENV`], or the defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| {
            Err(ConfigError::Invalid { field, reason })
        };
        if self.planner.max_rewrite_passes == 0 {
            return invalid("planner.max_rewrite_passes", "must be at least 1".into());
        }
        if self.planner.memory_budget_bytes == 0 {
            return invalid("planner.memory_budget_bytes", "must be positive".into());
        }
        if self.execution.max_workers == 0 {
            return invalid("execution.max_workers", "must be at least 1".into());
        }
        if self.execution.channel_capacity == 0 {
            return invalid("execution.channel_capacity", "must be at least 1".into());
        }
        if let Err(err) = self.cost.validate() {
            return invalid("cost", err.to_string());
        }
        Ok(())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`QueryConfig`].
    #[error("failed to parse config{}: {source}", .path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File path, when loaded from disk.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be serialized.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A setting is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = QueryConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, QueryConfig::default());
    }

    #[test]
    fn parses_sections() {
        let config = QueryConfig::from_toml_str(
            r#"
            [planner]
            max_rewrite_passes = 7
            match_order = "bottom_up"

            [execution]
            max_workers = 3

            [cost]
            wio = 0.4
            wcpu = 0.4
            wmemory = 0.1
            waccuracy = 0.1
            speedup_per_worker = 0.2
            non_parallelisable_io = 0.5
            "#,
        )
        .expect("config");
        assert_eq!(config.planner.max_rewrite_passes, 7);
        assert_eq!(config.planner.match_order, MatchOrder::BottomUp);
        assert_eq!(config.execution.max_workers, 3);
        assert_eq!(config.execution.channel_capacity, 64);
        assert_eq!(config.cost.wio, 0.4);
    }

    #[test]
    fn rejects_invalid_cost_policy() {
        let err = QueryConfig::from_toml_str(
            r#"
            [cost]
            wio = 0.9
            wcpu = 0.9
            wmemory = 0.0
            waccuracy = 0.0
            speedup_per_worker = 0.1
            non_parallelisable_io = 0.1
            "#,
        )
        .expect_err("weights sum to 1.8");
        assert!(matches!(err, ConfigError::Invalid { field: "cost", .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[execution]\nchannel_capacity = 8").expect("write");
        let config = QueryConfig::load(file.path()).expect("load");
        assert_eq!(config.execution.channel_capacity, 8);
        let missing = QueryConfig::load(Path::new("/nonexistent/tessera.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
