//! CLI output formatting

use crate::core::{Identity, State, StateChangeListener, StateTag};
use crate::execution::{ItemSnapshot, RunSummary};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar counting items that reached a terminal state
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a state tag for display
pub fn format_tag(tag: StateTag) -> String {
    let label = tag.as_str().to_uppercase();
    match tag {
        StateTag::Scheduled => style(label).dim().to_string(),
        StateTag::Running => style(label).yellow().to_string(),
        StateTag::Retrying => style(label).magenta().to_string(),
        StateTag::Succeeded => style(label).green().to_string(),
        StateTag::Failed => style(label).red().to_string(),
        StateTag::Cancelled => style(label).yellow().to_string(),
    }
}

fn icon(tag: StateTag) -> Emoji<'static, 'static> {
    match tag {
        StateTag::Succeeded => CHECK,
        StateTag::Failed => CROSS,
        StateTag::Retrying | StateTag::Cancelled => WARN,
        StateTag::Running => SPINNER,
        StateTag::Scheduled => INFO,
    }
}

/// Format one transition for display
pub fn format_transition(identity: Identity, previous: &State, new: &State) -> String {
    let mut line = format!(
        "{}{} {} → {}",
        icon(new.tag()),
        style(identity.short()).dim(),
        format_tag(previous.tag()),
        format_tag(new.tag())
    );
    if let Some(failure) = new.failure() {
        line.push_str(&format!(" {}", style(failure).dim()));
    }
    line
}

/// Format the final line for one item
pub fn format_item(input: i64, snapshot: &ItemSnapshot, value: Option<i64>) -> String {
    let tag = snapshot.state.tag();
    let outcome = match (value, snapshot.state.failure()) {
        (Some(value), _) => style(value.to_string()).bold().to_string(),
        (None, Some(failure)) => style(failure.to_string()).red().to_string(),
        (None, None) => format_tag(tag),
    };
    format!(
        "  {}{} {} → {} ({}/{} steps)",
        icon(tag),
        style(snapshot.identity.short()).dim(),
        input,
        outcome,
        snapshot.completed_steps,
        snapshot.total_steps
    )
}

/// Format a run summary for display
pub fn format_summary(summary: &RunSummary) -> String {
    let status_icon = if summary.failed > 0 {
        CROSS
    } else if summary.cancelled > 0 {
        WARN
    } else {
        CHECK
    };

    format!(
        "{}{} - {} succeeded, {} failed, {} cancelled in {}ms",
        status_icon,
        style(&summary.pipeline).bold(),
        style(summary.succeeded).green(),
        style(summary.failed).red(),
        style(summary.cancelled).yellow(),
        summary.elapsed_ms
    )
}

/// Prints every transition and advances a progress bar on terminal states
pub struct ConsoleListener {
    progress: Option<ProgressBar>,
}

impl ConsoleListener {
    pub fn new(progress: Option<ProgressBar>) -> Self {
        Self { progress }
    }
}

impl StateChangeListener for ConsoleListener {
    fn on_state_changed(&self, identity: Identity, previous: &State, new: &State) -> anyhow::Result<()> {
        let line = format_transition(identity, previous, new);
        match &self.progress {
            Some(progress) => {
                progress.println(line);
                if new.is_terminal() {
                    progress.inc(1);
                }
            }
            None => println!("{}", line),
        }
        Ok(())
    }
}
