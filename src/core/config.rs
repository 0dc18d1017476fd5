//! Engine configuration from YAML

use crate::execution::scheduler::DEFAULT_MAX_WORKERS;
use crate::execution::SchedulingStrategy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Worker pool sizing as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One item at a time
    Sequential,
    /// Every ready item at once
    Parallel,
    /// At most `max_concurrency` items at once
    #[default]
    Limited,
}

/// Engine-level settings shared by every pipeline built from them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How items are spread over workers
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Worker count for the `limited` strategy
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts given to steps that do not set their own
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: usize,

    /// Number of shards in the item registry
    #[serde(default = "default_registry_shards")]
    pub registry_shards: usize,

    /// Allow the `Running ⇄ Retrying` transitions even when no step retries
    #[serde(default)]
    pub retries: bool,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_max_attempts() -> usize {
    1
}

fn default_registry_shards() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_concurrency: default_max_concurrency(),
            default_max_attempts: default_max_attempts(),
            registry_shards: default_registry_shards(),
            retries: false,
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse engine configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the engine configuration
    pub fn validate(&self) -> Result<()> {
        if self.strategy == StrategyKind::Limited && self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1 for the limited strategy");
        }
        if self.default_max_attempts == 0 {
            anyhow::bail!("default_max_attempts must be at least 1");
        }
        if self.registry_shards == 0 {
            anyhow::bail!("registry_shards must be at least 1");
        }
        Ok(())
    }

    /// The scheduling strategy these settings describe
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            StrategyKind::Sequential => SchedulingStrategy::Sequential,
            StrategyKind::Parallel => SchedulingStrategy::Parallel,
            StrategyKind::Limited => SchedulingStrategy::LimitedParallel(self.max_concurrency),
        }
    }
}
