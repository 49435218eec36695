//! CLI workflow definition subcommands: publish, list, validate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use stepflow_core::service::definition::parse_definition;
use stepflow_types::error::EngineError;
use stepflow_types::workflow::ValidationIssue;

use super::{new_table, Output};
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Compile a JSON or YAML definition and store it as a new version.
    Publish {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// List the latest version of every workflow.
    #[command(alias = "ls")]
    List,

    /// Compile a definition without storing it.
    Validate {
        /// Path to the definition file.
        file: PathBuf,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    out: Output,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Publish { file } => publish(&file, state, out).await,
        WorkflowCommand::List => list(state, out).await,
        WorkflowCommand::Validate { file } => validate(&file, state, out).await,
    }
}

async fn read_definition_text(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))
}

async fn publish(file: &Path, state: &AppState, out: Output) -> Result<()> {
    let text = read_definition_text(file).await?;

    let result = match parse_definition(&text) {
        Ok(def) => state.definitions.publish(def).await,
        Err(e) => Err(e),
    };
    let def = match result {
        Ok(def) => def,
        Err(EngineError::Validation(issues)) => {
            print_issues(&issues, out)?;
            anyhow::bail!("Workflow '{}' is invalid", file.display());
        }
        Err(e) => return Err(e.into()),
    };

    if out.json {
        out.print_json(&serde_json::json!({
            "id": def.id,
            "version": def.version,
            "name": def.name,
            "states": def.states.len(),
        }))?;
    } else if !out.quiet {
        println!();
        println!(
            "  {} Published workflow '{}' version {}",
            style("*").green().bold(),
            style(&def.id).cyan(),
            style(def.version).bold()
        );
        println!("  States: {}", def.states.len());
        println!();
        println!(
            "  Start a run: {}",
            style(format!("stepflow run start {}", def.id)).yellow()
        );
        println!();
    }
    Ok(())
}

async fn list(state: &AppState, out: Output) -> Result<()> {
    let workflows = state.definitions.list().await?;

    if out.json {
        return out.print_json(&workflows);
    }
    if out.quiet {
        return Ok(());
    }
    if workflows.is_empty() {
        println!();
        println!("  No workflows published yet.");
        println!(
            "  Publish one with: {}",
            style("stepflow workflow publish <file>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec!["ID", "Version", "Name", "States", "Published"]);
    for wf in &workflows {
        table.add_row(vec![
            Cell::new(&wf.id).fg(Color::Cyan),
            Cell::new(wf.version),
            Cell::new(&wf.name),
            Cell::new(wf.states),
            Cell::new(wf.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn validate(file: &Path, state: &AppState, out: Output) -> Result<()> {
    let text = read_definition_text(file).await?;
    let issues = match parse_definition(&text) {
        Ok(def) => state.definitions.validate(&def),
        Err(EngineError::Validation(issues)) => issues,
        Err(e) => return Err(e.into()),
    };

    if issues.is_empty() {
        if out.json {
            out.print_json(&serde_json::json!({ "valid": true, "issues": [] }))?;
        } else if !out.quiet {
            println!(
                "  {} {} is valid",
                style("*").green().bold(),
                style(file.display()).cyan()
            );
        }
        return Ok(());
    }

    print_issues(&issues, out)?;
    anyhow::bail!("{} has {} issue(s)", file.display(), issues.len())
}

fn print_issues(issues: &[ValidationIssue], out: Output) -> Result<()> {
    if out.json {
        return out.print_json(&serde_json::json!({ "valid": false, "issues": issues }));
    }

    let mut table = new_table();
    table.set_header(vec!["Code", "Path", "Message"]);
    for issue in issues {
        table.add_row(vec![
            Cell::new(&issue.code).fg(Color::Red),
            Cell::new(&issue.path),
            Cell::new(&issue.message),
        ]);
    }
    eprintln!("{table}");
    Ok(())
}
