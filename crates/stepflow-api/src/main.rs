//! Stepflow CLI and REST API entry point.
//!
//! Binary name: `stepflow`
//!
//! Parses CLI arguments, initializes the database and services, then
//! dispatches to the appropriate command handler or starts the server.

mod cli;
mod http;
mod state;

use clap::Parser;
use stepflow_infra::sqlite::pool::default_data_dir;
use stepflow_observe::tracing_setup::{
    init_tracing_with, shutdown_tracing, verbosity_filter, TracingOptions,
};

use cli::{Cli, Commands, Output};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let otel = matches!(cli.command, Commands::Serve { otel: true, .. });
    let default_filter = match &cli.command {
        // The server logs lifecycle events at info by default.
        Commands::Serve { .. } if cli.verbose == 0 && !cli.quiet => "info",
        _ => verbosity_filter(cli.verbose, cli.quiet),
    };
    init_tracing_with(&TracingOptions {
        default_filter: default_filter.to_string(),
        json: cli.log_json,
        otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let state = AppState::init(data_dir).await?;
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Commands::Serve { port, host, .. } => serve(state, &host, port, out).await,
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, out).await
        }
        Commands::Run { action } => cli::run::handle_run_command(action, &state, out).await,
        Commands::Approval { action } => {
            cli::approval::handle_approval_command(action, &state, out).await
        }
    };

    shutdown_tracing();
    result
}

/// Run the API server, scheduler workers and approval sweep until Ctrl+C or
/// SIGTERM.
async fn serve(state: AppState, host: &str, port: u16, out: Output) -> anyhow::Result<()> {
    let recovered = state.scheduler.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "re-enqueued orphaned runs");
    }

    let workers = state.scheduler.spawn_workers();
    let sweeper = state.approvals.start_sweeper(state.shutdown.clone());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        addr = addr.as_str(),
        workers = workers.len(),
        tasks = ?state.operations.tasks(),
        auth = state.api_key.is_some(),
        "stepflow server listening"
    );
    if !out.quiet && !out.json {
        println!(
            "  {} Stepflow API listening on {}",
            console::style("*").green().bold(),
            console::style(format!("http://{addr}")).cyan()
        );
        println!("  Data directory: {}", state.data_dir.display());
        if state.api_key.is_none() {
            println!(
                "  {}",
                console::style("Authentication disabled (STEPFLOW_API_KEY is not set)").yellow()
            );
        }
        println!("  {}", console::style("Press Ctrl+C to stop").dim());
    }

    let shutdown = state.shutdown.clone();
    let router = http::router::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "scheduler worker ended abnormally");
        }
    }
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "approval sweeper ended abnormally");
    }

    if !out.quiet && !out.json {
        println!("\n  Server stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
