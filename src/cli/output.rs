//! CLI output formatting

use crate::{
    core::{Run, RunStatus, SkipReason, StepState},
    events::{Event, EventKind},
    persistence::RunSummary,
};
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
pub static EYES: Emoji<'_, '_> = Emoji("👀 ", "? ");

/// Create a progress bar over the workflow's steps
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

/// A horizontal rule spanning the terminal width
pub fn separator() -> String {
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80);
    style("─".repeat(width)).dim().to_string()
}

/// Format a step state for display
pub fn format_step_state(state: &StepState) -> String {
    match state {
        StepState::Pending => style("PENDING").dim().to_string(),
        StepState::Ready => style("READY").dim().to_string(),
        StepState::Running => style("RUNNING").yellow().to_string(),
        StepState::Succeeded => style("SUCCEEDED").green().to_string(),
        StepState::Failed => style("FAILED").red().to_string(),
        StepState::Skipped { reason } => {
            let why = match reason {
                SkipReason::BranchDropped => "branch dropped".to_string(),
                SkipReason::UpstreamFailed { step } => format!("upstream {} failed", step),
                SkipReason::RunAborted => "run aborted".to_string(),
            };
            style(format!("SKIPPED ({})", why)).dim().to_string()
        }
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::AwaitingReview => style("AWAITING REVIEW").blue().to_string(),
        RunStatus::Recovering => style("RECOVERING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Aborted => style("ABORTED").red().to_string(),
    }
}

/// Format run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunStatus::Completed => CHECK,
        RunStatus::Aborted => CROSS,
        RunStatus::Running | RunStatus::Recovering => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} ({}/{}) - {}",
        status_icon,
        style(short_id(&summary.run_id.to_string())).dim(),
        style(&summary.workflow).bold(),
        format_status(summary.status),
        summary.succeeded_steps,
        summary.total_steps,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// Format a run event for display
///
/// Token events are rendered by the caller and yield `None` here.
pub fn format_event(event: &Event) -> Option<String> {
    let step = event.step_id.as_deref().unwrap_or("-");
    let attempt = event.field_u64("attempt").unwrap_or(1);

    let line = match event.kind {
        EventKind::Token => return None,
        EventKind::StepStarted => {
            if attempt > 1 {
                format!(
                    "{} {} (attempt {})",
                    SPINNER,
                    style(step).cyan(),
                    style(attempt).dim()
                )
            } else {
                format!("{} {}", SPINNER, style(step).cyan())
            }
        }
        EventKind::StepCompleted => format!("{} {}", CHECK, style(step).green()),
        EventKind::StepFailed => format!(
            "{} {}: {} {}",
            CROSS,
            style(step).red(),
            event.field_str("message").unwrap_or_default(),
            style(format!("[{}]", event.field_str("kind").unwrap_or("error"))).dim()
        ),
        EventKind::RunRecovering => format!(
            "{} retrying {} in {}",
            WARN,
            style(event.field_str("step").unwrap_or(step)).yellow(),
            style(format_duration(Duration::from_millis(
                event.field_u64("delay_ms").unwrap_or(0)
            )))
            .dim()
        ),
        EventKind::RunAwaitingReview => format!(
            "{} {} is waiting for review",
            EYES,
            style(event.field_str("step").unwrap_or(step)).bold()
        ),
        EventKind::RunCompleted => format!("{} Run {}", INFO, style("completed").green()),
        EventKind::RunAborted => format!(
            "{} Run {}: {}",
            INFO,
            style("aborted").red(),
            event.field_str("message").unwrap_or_default()
        ),
    };
    Some(line)
}

/// Per-step breakdown of a run
pub fn format_run_steps(run: &Run) -> Vec<String> {
    let mut lines: Vec<String> = run
        .steps
        .iter()
        .map(|(id, record)| {
            format!(
                "  {:<24} {} (attempts: {})",
                id,
                format_step_state(&record.state),
                record.attempts
            )
        })
        .collect();

    if !run.error_log.is_empty() {
        lines.push(format!("  {}", style("Failures:").bold()));
        for failure in &run.error_log {
            lines.push(format!(
                "    {} #{} [{}] {}",
                style(&failure.step_id).red(),
                failure.attempt,
                failure.kind,
                failure.message
            ));
        }
    }

    if let Some(cause) = &run.cause {
        lines.push(format!(
            "  {} {} ({}): {}",
            style("Cause:").bold(),
            cause.step_id.as_deref().unwrap_or("cancelled"),
            cause.kind,
            cause.message
        ));
    }

    lines
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
