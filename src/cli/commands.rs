//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Input value; repeat to submit several. Replaces the file's inputs.
    #[arg(short, long, allow_negative_numbers = true)]
    pub input: Vec<i64>,

    /// Override the scheduling strategy from the file
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

impl StrategyArg {
    /// Resolve against the worker count configured for the pipeline
    pub fn to_strategy(self, max_concurrency: usize) -> SchedulingStrategy {
        match self {
            StrategyArg::Sequential => SchedulingStrategy::Sequential,
            StrategyArg::Parallel => SchedulingStrategy::Parallel,
            StrategyArg::ParallelLimited => SchedulingStrategy::LimitedParallel(max_concurrency),
        }
    }
}
