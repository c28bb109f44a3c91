// Spine CLI
//
// In-process adapter over the command layer: the CLI builds the same runtime
// as the API server and executes commands directly against the database.
// Exit codes: 0 success, 1 failure/degraded, 2 not-found, 3 invalid params.

mod commands;
mod output;
mod pipelines;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use spine_core::{config::init_tracing, CoreConfig, SpineError};

#[derive(Parser)]
#[command(name = "spine")]
#[command(about = "Spine - data-pipeline orchestration for financial/regulatory datasets")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Database administration
    Db {
        #[command(subcommand)]
        command: commands::db::DbCommand,
    },

    /// Inspect registered pipelines
    Pipelines {
        #[command(subcommand)]
        command: commands::pipelines::PipelinesCommand,
    },

    /// Submit a pipeline and (sync tier) wait for the result
    Run {
        /// Pipeline name
        name: String,

        /// Parameters as key=value (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        /// Validate and print the admission plan without submitting
        #[arg(long)]
        dry_run: bool,

        /// Routing lane
        #[arg(long, default_value = "normal", value_parser = ["normal", "backfill", "realtime"])]
        lane: String,

        /// Idempotency key for replay-safe submission
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Health checks
    Doctor,

    /// Dead-letter queue inspection and replay
    Dlq {
        #[command(subcommand)]
        command: commands::dlq::DlqCommand,
    },

    /// Declarative schedules
    Schedules {
        #[command(subcommand)]
        command: commands::schedules::SchedulesCommand,
    },
}

/// Map an error onto the documented exit codes
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<SpineError>().map(SpineError::code) {
        Some("PIPELINE_NOT_FOUND") | Some("NOT_FOUND") => ExitCode::from(2),
        Some("INVALID_PARAMS") | Some("CONFIG") => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(3);
        }
    };
    if !cli.quiet {
        init_tracing(&config.log_level, config.log_format);
    }

    let format = output::OutputFormat::from_str(&cli.output);

    let result = match cli.command {
        Commands::Db { command } => commands::db::run(command, &config, format).await,
        Commands::Pipelines { command } => {
            commands::pipelines::run(command, &config, format).await
        }
        Commands::Run {
            name,
            params,
            dry_run,
            lane,
            idempotency_key,
        } => {
            commands::run::run(
                &config,
                format,
                name,
                params,
                dry_run,
                lane,
                idempotency_key,
            )
            .await
        }
        Commands::Doctor => commands::doctor::run(&config, format).await,
        Commands::Dlq { command } => commands::dlq::run(command, &config, format).await,
        Commands::Schedules { command } => {
            commands::schedules::run(command, &config, format).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}
