//! CLI command definitions and dispatch for the `stepflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (`stepflow workflow publish`, `stepflow run start`, ...). Every
//! command works directly against the local database; `serve` additionally
//! runs the scheduler workers and the REST API.

pub mod approval;
pub mod run;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{presets, ContentArrangement, Table};

/// Durable workflow engine with human approvals.
#[derive(Parser)]
#[command(name = "stepflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Data directory holding `stepflow.db` and `config.toml`.
    #[arg(long, global = true, env = "STEPFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server, scheduler workers and approval sweep.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Export spans with the OpenTelemetry stdout exporter.
        #[arg(long)]
        otel: bool,
    },

    /// Manage workflow definitions (publish, list, validate).
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start and control workflow runs.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// List, inspect and decide human approvals.
    Approval {
        #[command(subcommand)]
        action: approval::ApprovalCommand,
    },
}

/// Output settings shared by every command handler.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    /// Print `value` as pretty JSON.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// A table with the shared CLI look.
pub(crate) fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Shorten long values for table cells.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
