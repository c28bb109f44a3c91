// `spine dlq` - dead-letter inspection and replay

use std::process::ExitCode;

use anyhow::Result;
use clap::Subcommand;
use uuid::Uuid;

use spine_core::CoreConfig;
use spine_storage::Pagination;

use crate::output::{table, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List unresolved dead letters
    List {
        /// Filter by pipeline name
        #[arg(long)]
        pipeline: Option<String>,

        /// Include resolved entries
        #[arg(long)]
        all: bool,

        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Replay a dead letter as a fresh execution
    Retry { id: Uuid },
    /// Mark a dead letter resolved without replaying
    Resolve { id: Uuid },
}

pub async fn run(
    command: DlqCommand,
    config: &CoreConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    let runtime = super::runtime(config).await?;

    match command {
        DlqCommand::List {
            pipeline,
            all,
            limit,
        } => {
            let entries = runtime
                .dlq
                .list(pipeline, all, Pagination { offset: 0, limit })
                .await
                .map_err(anyhow::Error::new)?;
            format.emit(&entries, |entries| {
                if entries.is_empty() {
                    return "dead-letter queue is empty".to_string();
                }
                table(
                    &["ID", "PIPELINE", "KIND", "RETRIES", "DEAD AT", "RESOLVED"],
                    entries
                        .iter()
                        .map(|d| {
                            vec![
                                d.id.to_string(),
                                d.pipeline.clone(),
                                d.error_kind.clone(),
                                d.retry_count.to_string(),
                                d.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                                if d.resolved_at.is_some() { "yes" } else { "no" }.to_string(),
                            ]
                        })
                        .collect(),
                )
            });
        }
        DlqCommand::Retry { id } => {
            let execution = runtime.dlq.retry(id).await.map_err(anyhow::Error::new)?;
            format.emit(&execution, |e| {
                format!("replayed as execution {} ({})", e.id, e.status)
            });
        }
        DlqCommand::Resolve { id } => {
            let resolved = runtime.dlq.resolve(id).await.map_err(anyhow::Error::new)?;
            format.emit(&resolved, |resolved| {
                if *resolved {
                    format!("dead letter {id} resolved")
                } else {
                    format!("dead letter {id} was already resolved")
                }
            });
        }
    }

    Ok(super::OK)
}
