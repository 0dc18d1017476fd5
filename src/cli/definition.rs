//! YAML pipeline definitions for the `pipe` binary
//!
//! A definition names a chain of integer operations plus the engine settings
//! and default inputs to run it with:
//!
//! ```yaml
//! name: arithmetic
//! engine:
//!   strategy: limited
//!   max_concurrency: 2
//! steps:
//!   - name: bump
//!     op: add
//!     operand: 1
//!   - name: guard
//!     op: fail_above
//!     operand: 100
//!     max_attempts: 2
//! inputs: [1, 2, 3]
//! ```

use crate::core::{async_step_fn, step_fn, EngineConfig};
use crate::execution::{Pipeline, PipelineBuilder, SchedulingStrategy};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Integer operation performed by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// value + operand
    Add,
    /// value * operand
    Multiply,
    /// Always fails
    Fail,
    /// Fails when value > operand
    FailAbove,
    /// Sleeps `operand` milliseconds, value unchanged
    SleepMs,
}

/// One entry of the `steps` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    pub op: Operation,

    #[serde(default)]
    pub operand: i64,

    /// Falls back to `engine.default_max_attempts`
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

impl StepDefinition {
    fn attempts(&self, engine: &EngineConfig) -> usize {
        self.max_attempts.unwrap_or(engine.default_max_attempts)
    }
}

/// A pipeline as written in a YAML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default)]
    pub engine: EngineConfig,

    pub steps: Vec<StepDefinition>,

    /// Values submitted when no `--input` is given
    #[serde(default)]
    pub inputs: Vec<i64>,
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }
        if self.steps.is_empty() {
            anyhow::bail!("Pipeline '{}' has no steps", self.name);
        }
        self.engine.validate().context("Invalid engine settings")?;

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name: {}", step.name);
            }
            if step.attempts(&self.engine) == 0 {
                anyhow::bail!("Step '{}' must allow at least one attempt", step.name);
            }
            if step.op == Operation::SleepMs && step.operand < 0 {
                anyhow::bail!("Step '{}' cannot sleep for a negative duration", step.name);
            }
        }
        Ok(())
    }

    /// Build the pipeline, optionally overriding the configured strategy
    pub fn to_pipeline(&self, strategy: Option<SchedulingStrategy>) -> Result<Pipeline<i64>> {
        let mut builder = PipelineBuilder::from_config(self.name.clone(), &self.engine);
        if let Some(strategy) = strategy {
            builder = builder.strategy(strategy);
        }

        for step in &self.steps {
            let attempts = step.attempts(&self.engine);
            let name = step.name.clone();
            let operand = step.operand;

            builder = match step.op {
                Operation::Add => builder.step_with_attempts(
                    name,
                    attempts,
                    step_fn(move |x: i64| {
                        x.checked_add(operand)
                            .ok_or_else(|| anyhow!("{} + {} overflows", x, operand))
                    }),
                ),
                Operation::Multiply => builder.step_with_attempts(
                    name,
                    attempts,
                    step_fn(move |x: i64| {
                        x.checked_mul(operand)
                            .ok_or_else(|| anyhow!("{} * {} overflows", x, operand))
                    }),
                ),
                Operation::Fail => builder.step_with_attempts(
                    name,
                    attempts,
                    step_fn(|x: i64| -> Result<i64> { Err(anyhow!("refusing {}", x)) }),
                ),
                Operation::FailAbove => builder.step_with_attempts(
                    name,
                    attempts,
                    step_fn(move |x: i64| {
                        if x > operand {
                            anyhow::bail!("{} is above the limit of {}", x, operand);
                        }
                        Ok(x)
                    }),
                ),
                Operation::SleepMs => {
                    let pause = Duration::from_millis(operand.max(0) as u64);
                    builder.step_with_attempts(
                        name,
                        attempts,
                        async_step_fn(move |x: i64| async move {
                            tokio::time::sleep(pause).await;
                            Ok(x)
                        }),
                    )
                }
            };
        }

        builder
            .build()
            .with_context(|| format!("Failed to build pipeline '{}'", self.name))
    }
}
