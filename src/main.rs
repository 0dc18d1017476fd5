use anyhow::{Context, Result};
use pipe::cli::commands::{RunCommand, ValidateCommand};
use pipe::cli::definition::PipelineDefinition;
use pipe::cli::output::*;
use pipe::cli::{Cli, Command};
use pipe::{Identity, LoggingListener};
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG overrides the --verbose level
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, cli.verbose).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand, verbose: bool) -> Result<()> {
    let definition = PipelineDefinition::from_file(&cmd.file)
        .context("Failed to load pipeline definition")?;
    let strategy = cmd
        .strategy
        .map(|arg| arg.to_strategy(definition.engine.max_concurrency));
    let pipeline = definition.to_pipeline(strategy)?;

    let inputs = if cmd.input.is_empty() {
        definition.inputs.clone()
    } else {
        cmd.input.clone()
    };
    if inputs.is_empty() {
        anyhow::bail!("No inputs: pass --input or list them under `inputs:`");
    }

    let progress = if cmd.json {
        None
    } else {
        println!(
            "{}Running {} over {} inputs ({:?})",
            ROCKET,
            style(pipeline.name()).bold(),
            style(inputs.len()).cyan(),
            pipeline.strategy()
        );
        let progress = create_progress_bar(inputs.len());
        pipeline.register(ConsoleListener::new(Some(progress.clone())))?;
        Some(progress)
    };
    if verbose {
        pipeline.register(LoggingListener)?;
    }

    let submitted: Vec<(i64, Identity)> = inputs
        .iter()
        .map(|&input| (input, pipeline.submit(input)))
        .collect();
    let summary = pipeline.run().await?;
    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if cmd.json {
        let mut items = Vec::with_capacity(submitted.len());
        for (input, identity) in &submitted {
            let snapshot = pipeline.snapshot(*identity)?;
            items.push(serde_json::json!({
                "identity": identity,
                "input": input,
                "state": snapshot.state.tag(),
                "path": snapshot.state.path(),
                "value": pipeline.result(*identity).ok(),
                "error": snapshot.state.failure().map(|f| f.to_string()),
                "completed_steps": snapshot.completed_steps,
            }));
        }
        let data = serde_json::json!({ "summary": summary, "items": items });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!();
        for (input, identity) in &submitted {
            let snapshot = pipeline.snapshot(*identity)?;
            let value = pipeline.result(*identity).ok();
            println!("{}", format_item(*input, &snapshot, value));
        }
        println!("\n{}", format_summary(&summary));
    }

    if summary.failed > 0 {
        error!("{} of {} items failed", summary.failed, submitted.len());
        std::process::exit(1);
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{}Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{}Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Steps: {}", style(definition.steps.len()).cyan());
            println!("  Inputs: {}", style(definition.inputs.len()).cyan());
            println!(
                "  Strategy: {}",
                style(format!("{:?}", definition.engine.scheduling_strategy())).dim()
            );

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{}Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}
