//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running a workflow document to completion (`run`)
//! - Validating a document without executing it (`validate`)
//! - Serving the REST API (`serve`)

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentFactory;
use crate::engine::{Scheduler, WorkflowState};
use crate::error::Error;
use crate::settings::Settings;
use crate::workflow;

/// Exit code for invalid configuration, per sysexits EX_USAGE conventions.
const EXIT_CONFIG_INVALID: u8 = 64;
/// Exit code for an interrupted run.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(about = "Declarative workflow engine that drives external agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a workflow document and wait for the result
    Run {
        /// Path to the workflow document (.yaml, .yml or .json)
        file: PathBuf,

        /// Override the document's parallel_execution flag
        #[arg(long)]
        parallel: bool,

        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Load and validate a workflow document without executing it
    Validate {
        /// Path to the workflow document
        file: PathBuf,
    },

    /// Serve the REST API
    Serve {
        /// Bind host (overrides FOREMAN_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides FOREMAN_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Run the selected command, mapping outcomes to process exit codes:
/// 0 completed, 1 failed, 2 partially completed, 64 invalid configuration,
/// 130 cancelled.
pub async fn run_command(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run {
            file,
            parallel,
            json,
        } => run_workflow(file, parallel, json).await,
        Command::Validate { file } => validate_workflow(file),
        Command::Serve { host, port } => serve(host, port).await,
    }
}

async fn run_workflow(file: PathBuf, parallel: bool, json: bool) -> ExitCode {
    let mut definition = match workflow::load_from_file(&file) {
        Ok(definition) => definition,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    if parallel {
        definition.parallel_execution = true;
    }

    // Ctrl-C cancels the run; tasks in flight are interrupted and the
    // report reflects what finished.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling workflow");
            signal_cancel.cancel();
        }
    });

    let scheduler = Scheduler::new(AgentFactory::new());
    let report = match scheduler.run_with_cancel(&definition, cancel).await {
        Ok(report) => report,
        Err(Error::Config(error)) => {
            eprintln!("error: {error}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(rendered) => println!("{rendered}"),
            Err(error) => eprintln!("error: failed to render report: {error}"),
        }
    } else {
        print_summary(&report);
    }

    match report.status {
        WorkflowState::Completed => ExitCode::SUCCESS,
        WorkflowState::PartiallyCompleted => ExitCode::from(2),
        WorkflowState::Cancelled => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::FAILURE,
    }
}

fn print_summary(report: &crate::engine::WorkflowReport) {
    println!("workflow: {} ({})", report.name, report.workflow_id);
    println!(
        "status:   {} in {:.2}s",
        report.status, report.elapsed_secs
    );
    println!(
        "tasks:    {} completed, {} failed, {} cancelled of {}",
        report.completed_tasks, report.failed_tasks, report.cancelled_tasks, report.total_tasks
    );
    for task in &report.tasks {
        let detail = match (&task.result, &task.error) {
            (_, Some(error)) => error.message.clone(),
            (Some(result), None) => {
                serde_json::to_string(result).unwrap_or_else(|_| "<unprintable>".to_string())
            }
            (None, None) => String::new(),
        };
        println!(
            "  {:<24} {:<10} attempts={} {}",
            task.name,
            task.state.as_str(),
            task.attempts,
            detail
        );
    }
}

fn validate_workflow(file: PathBuf) -> ExitCode {
    match workflow::load_from_file(&file) {
        Ok(definition) => {
            println!(
                "{}: ok ({} agents, {} tasks)",
                definition.name,
                definition.agents.len(),
                definition.tasks.len()
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(EXIT_CONFIG_INVALID)
        }
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> ExitCode {
    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    match crate::server::serve(&settings.server).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
