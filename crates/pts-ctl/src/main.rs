//! # ptsctl
//!
//! Command-line front-ends for the Package Tracking System: the MTA entry
//! points (`dispatch`, `control`), the task engine drivers (`run-task`,
//! `resume-jobs`) and the administrative commands.
//!
//! Exit code policy: per-message faults are logged and exit zero so the
//! MTA never requeues them; only startup misconfiguration exits non-zero.

mod commands;
mod tasks;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pts_shared::logging::init_tracing;
use pts_shared::PtsConfig;

#[derive(Debug, Parser)]
#[command(name = "ptsctl", about = "Package Tracking System control tool")]
struct Cli {
    /// Configuration file base name (without extension).
    #[arg(long, default_value = "pts")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process a received package message from stdin.
    Dispatch,
    /// Process a received control message from stdin.
    Control,
    /// Run a job starting from the named task.
    RunTask {
        name: String,
        /// Additional job parameters as a JSON object.
        #[arg(long)]
        parameters: Option<String>,
    },
    /// Reconstruct and continue all incomplete jobs.
    ResumeJobs,
    /// Remove all subscriptions of the given emails.
    UnsubscribeAll { emails: Vec<String> },
    /// Print subscribers per package.
    DumpSubscribers {
        /// List inactive instead of active subscriptions.
        #[arg(long)]
        inactive: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print subscription statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = PtsConfig::load_from(&cli.config)?;
    let app = commands::App::new(config)?;

    match cli.command {
        Commands::Dispatch => app.dispatch().await,
        Commands::Control => app.control().await,
        Commands::RunTask { name, parameters } => app.run_task(&name, parameters).await,
        Commands::ResumeJobs => app.resume_jobs().await,
        Commands::UnsubscribeAll { emails } => app.unsubscribe_all(&emails).await,
        Commands::DumpSubscribers { inactive, json } => {
            app.dump_subscribers(inactive, json).await
        }
        Commands::Stats { json } => app.stats(json).await,
    }
}
