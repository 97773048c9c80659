//! # schemaflow
//!
//! Run, resume and inspect durable schema design sessions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schemaflow_cli::commands::{self, Fixtures};
use schemaflow_cli::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schemaflow")]
#[command(about = "Durable schema design sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ./schemaflow.toml when present)
    #[arg(long, global = true, env = "SCHEMAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Tenant that owns the sessions
    #[arg(long, global = true, env = "SCHEMAFLOW_TENANT")]
    tenant: Option<String>,

    /// Checkpoint database
    #[arg(long, global = true, env = "SCHEMAFLOW_DATABASE_URL")]
    database_url: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a design session
    Run {
        #[arg(long)]
        thread: String,

        /// The design request
        #[arg(long)]
        input: String,

        /// Schema patch script (JSON or YAML)
        #[arg(long)]
        proposals: PathBuf,

        /// Test case script (JSON or YAML)
        #[arg(long)]
        testcases: PathBuf,
    },

    /// Continue an interrupted session
    Resume {
        #[arg(long)]
        thread: String,

        /// Resume from this checkpoint instead of the latest one
        #[arg(long)]
        checkpoint: Option<String>,

        #[arg(long)]
        proposals: PathBuf,

        #[arg(long)]
        testcases: PathBuf,
    },

    /// List a session's checkpoints, newest first
    History {
        #[arg(long)]
        thread: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only checkpoints older than this one
        #[arg(long)]
        before: Option<String>,
    },

    /// Delete a session and all of its checkpoints
    Delete {
        #[arg(long)]
        thread: String,
    },

    /// Print the effective settings
    Config,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())
        .context("loading settings")?
        .with_overrides(cli.tenant, cli.database_url);
    let mut out = std::io::stdout().lock();

    if let Commands::Config = cli.command {
        return commands::show_config(&settings, &mut out);
    }
    settings.validate()?;

    match cli.command {
        Commands::Run {
            thread,
            input,
            proposals,
            testcases,
        } => {
            let fixtures = Fixtures {
                proposals,
                testcases,
            };
            let handle = commands::start_run(&settings, &thread, &input, &fixtures).await?;
            cancel_on_ctrl_c(&handle);
            commands::drive(handle, &mut out).await?;
        }
        Commands::Resume {
            thread,
            checkpoint,
            proposals,
            testcases,
        } => {
            let fixtures = Fixtures {
                proposals,
                testcases,
            };
            let handle = commands::start_resume(&settings, &thread, checkpoint, &fixtures).await?;
            cancel_on_ctrl_c(&handle);
            commands::drive(handle, &mut out).await?;
        }
        Commands::History {
            thread,
            limit,
            before,
        } => {
            commands::history(&settings, &thread, limit, before, &mut out).await?;
        }
        Commands::Delete { thread } => {
            commands::delete(&settings, &thread, &mut out).await?;
        }
        Commands::Config => {}
    }

    Ok(())
}

/// Ctrl-C cancels the run; the last checkpoint stays resumable.
fn cancel_on_ctrl_c(handle: &schemaflow_core::RunHandle) {
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            token.cancel();
        }
    });
}
