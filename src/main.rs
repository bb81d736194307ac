use adflow::cli::commands::{
    EventsCommand, HistoryCommand, ListCommand, RunCommand, ValidateCommand,
};
use adflow::cli::output::*;
use adflow::cli::{Cli, Command};
use adflow::core::{Capability, Payload, Run, RunStatus, WorkflowDefinition};
use adflow::events::EventKind;
use adflow::persistence::{InMemoryRunStore, RunStore, RunSummary};
use adflow::{CommandGenerator, ExecutionEngine, GeneratorConfig, WorkflowConfig};
use anyhow::{Context, Result};
use console::Term;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let fallback = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    match &cli.command {
        Command::Run(cmd) => run_workflow(cmd, cli.stream).await?,
        Command::Validate(cmd) => validate_workflow(cmd)?,
        Command::List(cmd) => list_workflows(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Events(cmd) => show_events(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn RunStore>> {
    let store = adflow::persistence::SqliteRunStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn RunStore>> {
    anyhow::bail!("Run history requires the `sqlite` feature")
}

/// Values that parse as JSON keep their type, everything else is a string
fn parse_inputs(pairs: &[(String, String)]) -> Payload {
    pairs
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            (key.clone(), value)
        })
        .collect()
}

async fn run_workflow(cmd: &RunCommand, stream: bool) -> Result<()> {
    let config = WorkflowConfig::from_file(&cmd.file).context("Failed to load workflow")?;
    let workflow = Arc::new(config.to_definition().context("Invalid workflow")?);

    println!("{} Loaded workflow: {}", INFO, style(&workflow.name).bold());

    let inputs = config.initial_inputs(parse_inputs(&cmd.input));
    for (key, value) in &inputs {
        println!("{} Input: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let store: Arc<dyn RunStore> = if cmd.no_history {
        Arc::new(InMemoryRunStore::new())
    } else {
        open_history().await?
    };

    let generator = match &cmd.generator {
        Some(command) => GeneratorConfig::from_command_line(command)
            .context("--generator must name a program")?,
        None => GeneratorConfig::default(),
    };

    let mut engine_config = config.engine.clone();
    if cmd.max_concurrent.is_some() {
        engine_config.max_concurrent_steps = cmd.max_concurrent;
    }

    let engine = ExecutionEngine::new(CommandGenerator::new(generator))
        .with_config(&engine_config)
        .with_store(Arc::clone(&store));

    let run_id = engine.submit(Arc::clone(&workflow), inputs).await?;
    println!(
        "{} Starting run {}\n",
        ROCKET,
        style(&run_id.to_string()[..8]).dim()
    );

    let progress = create_progress_bar(workflow.len());
    let mut events = engine.subscribe(run_id, 0)?;
    let bar = progress.clone();
    let printer = tokio::spawn(async move {
        let mut streaming_step: Option<String> = None;
        while let Some(event) = events.next().await {
            if event.kind == EventKind::Token {
                if stream {
                    let token = event.field_str("token").unwrap_or_default().to_string();
                    let header = (streaming_step != event.step_id).then(|| {
                        streaming_step = event.step_id.clone();
                        separator()
                    });
                    bar.suspend(|| {
                        if let Some(header) = header {
                            println!("{}", header);
                        }
                        print!("{}", token);
                        let _ = std::io::stdout().flush();
                    });
                }
                continue;
            }
            if streaming_step.take().is_some() {
                bar.println("");
            }
            if let Some(line) = format_event(&event) {
                bar.println(line);
            }
            if event.kind == EventKind::StepCompleted {
                bar.inc(1);
            }
        }
        bar.finish_and_clear();
    });

    loop {
        let run = engine.wait(run_id).await?;
        if run.status != RunStatus::AwaitingReview {
            break;
        }

        let approved = if cmd.auto_approve {
            true
        } else if cmd.reject {
            false
        } else {
            let question = review_question(&workflow);
            let bar = progress.clone();
            tokio::task::spawn_blocking(move || bar.suspend(|| ask_approval(&question)))
                .await
                .context("Review prompt failed")??
        };
        engine.approve(run_id, approved, Payload::new()).await?;
    }

    let run = engine.wait_for_terminal(run_id).await?;
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    if !cmd.no_history {
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(&run_id.to_string()[..8]).dim()
        );
    }

    if run.status == RunStatus::Completed {
        for (key, value) in &run.outputs {
            let text = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)?,
            };
            println!("\n{}\n{}", style(key).bold(), format_output(&text, 10));
        }
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&workflow.name).bold(),
            style("successfully").green()
        );
        Ok(())
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&workflow.name).bold(),
            style("aborted").red()
        );
        for line in format_run_steps(&run) {
            println!("{}", line);
        }
        std::process::exit(1);
    }
}

fn review_question(workflow: &WorkflowDefinition) -> String {
    let gate = workflow.gate().and_then(|id| workflow.step(id));
    let prompt = gate.and_then(|step| match &step.capability {
        Capability::ReviewGate { prompt } => prompt.clone(),
        _ => None,
    });
    match (gate, prompt) {
        (_, Some(prompt)) => prompt,
        (Some(step), None) => format!("Approve '{}'?", step.display_name()),
        (None, None) => "Approve?".to_string(),
    }
}

/// Blocking y/n prompt on the terminal
fn ask_approval(question: &str) -> Result<bool> {
    let term = Term::stderr();
    loop {
        term.write_str(&format!("{} {} [y/n] ", EYES, style(question).bold()))?;
        let answer = term.read_line()?;
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => term.write_line("Please answer y or n")?,
        }
    }
}

fn validate_workflow(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating workflow...", INFO);

    let result = WorkflowConfig::from_file(&cmd.file)
        .and_then(|config| Ok((config.to_definition()?, config)));

    match result {
        Ok((definition, config)) => {
            println!("{} Workflow is valid!", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Steps: {}", style(definition.len()).cyan());
            println!("  Inputs: {}", style(definition.initial_inputs.join(", ")).cyan());
            println!(
                "  Order: {}",
                style(definition.execution_order().join(" → ")).dim()
            );
            if let Some(gate) = definition.gate() {
                println!("  Review gate: {}", style(gate).bold());
            }
            for (group, members) in definition.groups() {
                println!("  Group {}: {}", style(group).cyan(), members.join(", "));
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn list_workflows(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let workflows = store.list_workflows().await?;

    if workflows.is_empty() {
        println!("{} No workflows found in history", INFO);
        return Ok(());
    }

    if cmd.json {
        let mut json_data = Vec::new();
        for workflow in &workflows {
            let runs = store.list_runs(workflow).await?;
            json_data.push(serde_json::json!({
                "name": workflow,
                "run_count": runs.len(),
            }));
        }
        let data = serde_json::json!({ "workflows": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Workflows in history:", INFO);
    for workflow in &workflows {
        if cmd.with_counts {
            let runs = store.list_runs(workflow).await?;
            let completed = runs
                .iter()
                .filter(|r| r.status == RunStatus::Completed)
                .count();
            let aborted = runs
                .iter()
                .filter(|r| r.status == RunStatus::Aborted)
                .count();
            println!(
                "  {} ({} runs: {} completed, {} aborted)",
                style(workflow).bold(),
                style(runs.len()).cyan(),
                style(completed).green(),
                style(aborted).red()
            );
        } else {
            println!("  {}", style(workflow).bold());
        }
    }

    Ok(())
}

async fn all_runs(store: &dyn RunStore) -> Result<Vec<RunSummary>> {
    let mut runs = Vec::new();
    for workflow in store.list_workflows().await? {
        runs.extend(store.list_runs(&workflow).await?);
    }
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(runs)
}

/// Resolve a full run ID or a unique prefix of one
async fn find_run(store: &dyn RunStore, id: &str) -> Result<Option<Run>> {
    if let Ok(run_id) = Uuid::parse_str(id) {
        return store.load_run(run_id).await;
    }

    let matches: Vec<Uuid> = all_runs(store)
        .await?
        .into_iter()
        .map(|summary| summary.run_id)
        .filter(|run_id| run_id.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [] => Ok(None),
        [run_id] => store.load_run(*run_id).await,
        _ => anyhow::bail!("Run ID prefix '{}' is ambiguous", id),
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    if let Some(id) = &cmd.run_id {
        match find_run(store.as_ref(), id).await? {
            Some(run) => print_run_details(&run, cmd.verbose)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs: Vec<RunSummary> = match &cmd.workflow {
        Some(workflow) => store.list_runs(workflow).await?,
        None => all_runs(store.as_ref()).await?,
    }
    .into_iter()
    .take(cmd.limit)
    .collect();

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

async fn show_events(cmd: &EventsCommand) -> Result<()> {
    let store = open_history().await?;
    let Some(run) = find_run(store.as_ref(), &cmd.run_id).await? else {
        println!("{} Run not found", WARN);
        return Ok(());
    };

    if cmd.json {
        let data = serde_json::json!({
            "run_id": run.run_id,
            "status": run.status,
            "steps": run.steps,
            "error_log": run.error_log,
            "cause": run.cause,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_run_details(&run, false)?;
        for line in format_run_steps(&run) {
            println!("{}", line);
        }
    }
    Ok(())
}

fn print_run_details(run: &Run, verbose: bool) -> Result<()> {
    let summary = RunSummary::from(run);
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(run.run_id).cyan());
    println!("  Workflow: {}", style(&run.workflow).bold());
    println!("  Status: {}", format_status(run.status));
    println!("  Started: {}", style(run.created_at.to_rfc3339()).dim());
    if run.is_terminal() {
        println!("  Finished: {}", style(run.updated_at.to_rfc3339()).dim());
        if let Ok(duration) = run.updated_at.signed_duration_since(run.created_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.succeeded_steps,
        summary.total_steps
    );

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(run)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
