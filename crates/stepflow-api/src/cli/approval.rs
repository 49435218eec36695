//! CLI approval subcommands: list, show, approve, reject.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use stepflow_types::approval::{Approval, ApprovalFilter, ApprovalStatus, Decision};
use uuid::Uuid;

use super::{new_table, truncate, Output};
use crate::state::AppState;

/// Approval subcommands.
#[derive(Subcommand)]
pub enum ApprovalCommand {
    /// List approvals (pending by default).
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, approved, rejected, expired).
        #[arg(long)]
        status: Option<ApprovalStatus>,

        /// Show approvals of every status.
        #[arg(long, conflicts_with = "status")]
        all: bool,

        /// Only approvals of this run.
        #[arg(long)]
        run: Option<Uuid>,
    },

    /// Show one approval and its webhook deliveries.
    Show {
        /// Approval id.
        id: String,
    },

    /// Approve a pending approval; the run continues.
    Approve {
        /// Approval id.
        id: String,

        /// Who is deciding.
        #[arg(long)]
        actor: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a pending approval; the run continues with the rejection recorded.
    Reject {
        /// Approval id.
        id: String,

        /// Who is deciding.
        #[arg(long)]
        actor: String,

        #[arg(long, alias = "reason")]
        comment: Option<String>,
    },
}

/// Handle an approval subcommand.
pub async fn handle_approval_command(
    cmd: ApprovalCommand,
    state: &AppState,
    out: Output,
) -> Result<()> {
    match cmd {
        ApprovalCommand::List { status, all, run } => {
            let filter = ApprovalFilter {
                status: if all {
                    None
                } else {
                    Some(status.unwrap_or(ApprovalStatus::Pending))
                },
                run_id: run,
                limit: None,
            };
            list(state, &filter, out).await
        }
        ApprovalCommand::Show { id } => show(state, &id, out).await,
        ApprovalCommand::Approve { id, actor, comment } => {
            decide(state, &id, Decision::Approve, &actor, comment, out).await
        }
        ApprovalCommand::Reject { id, actor, comment } => {
            decide(state, &id, Decision::Reject, &actor, comment, out).await
        }
    }
}

async fn list(state: &AppState, filter: &ApprovalFilter, out: Output) -> Result<()> {
    let approvals = state.approvals.list(filter).await?;

    if out.json {
        return out.print_json(&approvals);
    }
    if out.quiet {
        return Ok(());
    }
    if approvals.is_empty() {
        println!();
        println!("  No approvals found.");
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec!["ID", "Run", "Status", "Message", "Approvers", "Times out"]);
    for approval in &approvals {
        table.add_row(vec![
            Cell::new(&approval.id),
            Cell::new(approval.run_id.to_string()),
            Cell::new(approval.status.as_str()).fg(status_color(approval.status)),
            Cell::new(truncate(&approval.message, 50)),
            Cell::new(if approval.approvers.is_empty() {
                "anyone".to_string()
            } else {
                approval.approvers.join(", ")
            }),
            Cell::new(approval.timeout_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show(state: &AppState, id: &str, out: Output) -> Result<()> {
    let approval = state.approvals.get(id).await?;
    let deliveries = state.approvals.deliveries(id).await?;

    if out.json {
        return out.print_json(&serde_json::json!({
            "approval": approval,
            "deliveries": deliveries,
        }));
    }
    if out.quiet {
        return Ok(());
    }

    print_approval(&approval);

    if deliveries.is_empty() {
        println!("  No webhook deliveries.");
        println!();
        return Ok(());
    }
    let mut table = new_table();
    table.set_header(vec!["Attempt", "Status", "HTTP", "Duration", "Error"]);
    for delivery in &deliveries {
        table.add_row(vec![
            Cell::new(delivery.attempt),
            Cell::new(delivery.status.as_str()),
            Cell::new(
                delivery
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(format!("{}ms", delivery.duration_ms)),
            Cell::new(truncate(delivery.error.as_deref().unwrap_or(""), 50)),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn decide(
    state: &AppState,
    id: &str,
    decision: Decision,
    actor: &str,
    comment: Option<String>,
    out: Output,
) -> Result<()> {
    let approval = state.approvals.decide(id, decision, actor, comment).await?;

    if out.json {
        return out.print_json(&approval);
    }
    if !out.quiet {
        println!();
        println!(
            "  {} Approval '{}' {} by {}",
            style("*").green().bold(),
            style(&approval.id).cyan(),
            approval.status.as_str(),
            actor
        );
        println!(
            "  Run {} continues from its next state.",
            style(approval.run_id).bold()
        );
        println!();
    }
    Ok(())
}

fn print_approval(approval: &Approval) {
    println!();
    println!("  Approval {}", style(&approval.id).bold());
    println!("  Run:      {}", approval.run_id);
    println!("  State:    {}", approval.state_id);
    println!(
        "  Status:   {}",
        style(approval.status.as_str()).fg(match approval.status {
            ApprovalStatus::Pending => console::Color::Yellow,
            ApprovalStatus::Approved => console::Color::Green,
            ApprovalStatus::Rejected | ApprovalStatus::Expired => console::Color::Red,
        })
    );
    println!("  Message:  {}", approval.message);
    if let Some(path) = &approval.summary_path {
        println!("  Summary:  {path}");
    }
    if let Some(by) = &approval.decided_by {
        println!("  Decided:  {by}");
    }
    if let Some(comment) = &approval.comment {
        println!("  Comment:  {comment}");
    }
    println!("  Times out {}", approval.timeout_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
}

fn status_color(status: ApprovalStatus) -> Color {
    match status {
        ApprovalStatus::Pending => Color::Yellow,
        ApprovalStatus::Approved => Color::Green,
        ApprovalStatus::Rejected | ApprovalStatus::Expired => Color::Red,
    }
}
