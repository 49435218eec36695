//! CLI run subcommands: start, list, show, cancel, pause, resume.
//!
//! `run start --wait` drives the scheduler in-process until the run finishes
//! or suspends, so a run can be executed end to end without `serve`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use stepflow_core::service::run::{CreateRunRequest, RunDetail};
use stepflow_types::run::{RunFilter, RunStatus, StepStatus, WorkflowRun};
use uuid::Uuid;

use super::{new_table, truncate, Output};
use crate::state::AppState;

/// Run subcommands.
#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a run of the latest (or given) workflow version.
    Start {
        /// Workflow id.
        workflow: String,

        /// Definition version (latest when omitted).
        #[arg(long)]
        version: Option<i64>,

        /// Run input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Execute the run in this process until it finishes or suspends.
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by workflow id.
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status (pending, running, waiting_approval, paused,
        /// completed, failed, cancelled).
        #[arg(long)]
        status: Option<RunStatus>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its context and step history.
    Show {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Cancel a run that has not finished.
    Cancel {
        /// Run UUID.
        run_id: Uuid,

        /// Reason recorded as the run error.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Pause a pending or running run at the next step boundary.
    Pause {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Resume a paused run.
    Resume {
        /// Run UUID.
        run_id: Uuid,
    },
}

/// Handle a run subcommand.
pub async fn handle_run_command(cmd: RunCommand, state: &AppState, out: Output) -> Result<()> {
    match cmd {
        RunCommand::Start {
            workflow,
            version,
            input,
            wait,
            timeout,
        } => {
            start(
                state,
                workflow,
                version,
                input.as_deref(),
                wait.then(|| Duration::from_secs(timeout)),
                out,
            )
            .await
        }
        RunCommand::List {
            workflow,
            status,
            limit,
        } => list(state, workflow, status, limit, out).await,
        RunCommand::Show { run_id } => show(state, &run_id, out).await,
        RunCommand::Cancel { run_id, reason } => {
            let run = state.runs.cancel_run(&run_id, reason).await?;
            print_transition(&run, "Cancelled", out)
        }
        RunCommand::Pause { run_id } => {
            let run = state.runs.pause_run(&run_id).await?;
            print_transition(&run, "Paused", out)
        }
        RunCommand::Resume { run_id } => {
            let run = state.runs.resume_run(&run_id).await?;
            print_transition(&run, "Resumed", out)
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn start(
    state: &AppState,
    workflow_id: String,
    version: Option<i64>,
    input: Option<&str>,
    wait: Option<Duration>,
    out: Output,
) -> Result<()> {
    let input = input
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Invalid JSON input")?;

    let run = state
        .runs
        .create_run(CreateRunRequest {
            workflow_id,
            version,
            input,
        })
        .await?;

    let Some(timeout) = wait else {
        if out.json {
            return out.print_json(&run);
        }
        if !out.quiet {
            println!();
            println!(
                "  {} Started run of '{}' (version {})",
                style("*").green().bold(),
                style(&run.workflow_id).cyan(),
                run.workflow_version
            );
            println!("  Run ID: {}", run.id);
            println!("  Status: {}", status_style(run.status));
            println!();
            println!(
                "  Runs execute while {} is running. Check progress: {}",
                style("stepflow serve").yellow(),
                style(format!("stepflow run show {}", run.id)).yellow()
            );
            println!();
        }
        return Ok(());
    };

    let finished = wait_for(state, &run.id, timeout).await?;
    let detail = state.runs.get_run(&finished.id).await?;
    print_detail(&detail, out)?;

    if finished.status == RunStatus::Failed {
        anyhow::bail!(
            "Run {} failed: {}",
            finished.id,
            finished.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Process queued work until the run stops making progress on its own.
async fn wait_for(state: &AppState, run_id: &Uuid, timeout: Duration) -> Result<WorkflowRun> {
    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(state.config.scheduler.poll_interval_ms.max(10));

    loop {
        state.scheduler.drain().await?;

        let run = state.runs.get_run(run_id).await?.run;
        if run.status.is_terminal()
            || matches!(run.status, RunStatus::WaitingApproval | RunStatus::Paused)
        {
            return Ok(run);
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "Timed out after {}s waiting for run {run_id} (status: {})",
                timeout.as_secs(),
                run.status
            );
        }
        tokio::time::sleep(poll).await;
    }
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

async fn list(
    state: &AppState,
    workflow_id: Option<String>,
    status: Option<RunStatus>,
    limit: u32,
    out: Output,
) -> Result<()> {
    let runs = state
        .runs
        .list_runs(&RunFilter {
            workflow_id,
            status,
            limit: Some(limit),
            offset: None,
        })
        .await?;

    if out.json {
        return out.print_json(&runs);
    }
    if out.quiet {
        return Ok(());
    }
    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec!["Run ID", "Workflow", "Status", "Current", "Created", "Error"]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(run.id.to_string()),
            Cell::new(format!("{} v{}", run.workflow_id, run.workflow_version)).fg(Color::Cyan),
            Cell::new(run.status.as_str()).fg(status_color(run.status)),
            Cell::new(run.current_state_id.as_deref().unwrap_or("-")),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(truncate(run.error.as_deref().unwrap_or(""), 40)),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show(state: &AppState, run_id: &Uuid, out: Output) -> Result<()> {
    let detail = state.runs.get_run(run_id).await?;
    print_detail(&detail, out)
}

fn print_detail(detail: &RunDetail, out: Output) -> Result<()> {
    if out.json {
        return out.print_json(detail);
    }
    if out.quiet {
        return Ok(());
    }

    let run = &detail.run;
    println!();
    println!(
        "  Run {} of '{}' (version {})",
        style(run.id).bold(),
        style(&run.workflow_id).cyan(),
        run.workflow_version
    );
    println!("  Status:  {}", status_style(run.status));
    if let Some(current) = &run.current_state_id {
        println!("  Current: {current}");
    }
    if let Some(error) = &run.error {
        println!("  Error:   {}", style(error).red());
    }
    if let Some(done) = run.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    println!("  Context:");
    let context = serde_json::to_string_pretty(&run.context)?;
    for line in context.lines() {
        println!("    {line}");
    }
    println!();

    if detail.steps.is_empty() {
        println!("  No steps executed yet.");
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec!["#", "State", "Scope", "Status", "Attempt", "Duration", "Error"]);
    for step in &detail.steps {
        let (label, color) = match step.status {
            StepStatus::Completed => ("completed", Color::Green),
            StepStatus::Failed => ("failed", Color::Red),
            StepStatus::WaitingApproval => ("waiting_approval", Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(step.seq),
            Cell::new(&step.state_id),
            Cell::new(step.scope.as_deref().unwrap_or("")),
            Cell::new(label).fg(color),
            Cell::new(step.attempt),
            Cell::new(format!("{}ms", step.duration_ms)),
            Cell::new(truncate(step.error.as_deref().unwrap_or(""), 50)),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_transition(run: &WorkflowRun, verb: &str, out: Output) -> Result<()> {
    if out.json {
        return out.print_json(run);
    }
    if !out.quiet {
        println!(
            "  {} {verb} run {} (now {})",
            style("*").green().bold(),
            run.id,
            status_style(run.status)
        );
    }
    Ok(())
}

fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkGrey,
        RunStatus::WaitingApproval | RunStatus::Paused => Color::Yellow,
        RunStatus::Pending | RunStatus::Running => Color::Cyan,
    }
}

fn status_style(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        RunStatus::Completed => text.green(),
        RunStatus::Failed => text.red(),
        RunStatus::Cancelled => text.dim(),
        RunStatus::WaitingApproval | RunStatus::Paused => text.yellow(),
        RunStatus::Pending | RunStatus::Running => text.cyan(),
    }
}
