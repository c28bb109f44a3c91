// `spine db` - database administration

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Subcommand;

use spine_core::CoreConfig;
use spine_storage::{applied_migrations, apply_migrations, Database};

use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum DbCommand {
    /// Apply all pending migrations
    Init,
    /// Show applied migrations
    Status,
}

pub async fn run(
    command: DbCommand,
    config: &CoreConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    let db = Database::from_url(&config.database_url)
        .await
        .context("connecting to database")?;

    match command {
        DbCommand::Init => {
            let applied = apply_migrations(db.pool()).await?;
            format.emit(&applied, |applied| {
                if applied.is_empty() {
                    "database is up to date".to_string()
                } else {
                    format!("applied {} migration(s):\n{}", applied.len(), applied.join("\n"))
                }
            });
        }
        DbCommand::Status => {
            let applied = applied_migrations(db.pool()).await?;
            format.emit(&applied, |applied| {
                format!("{} migration(s) applied:\n{}", applied.len(), applied.join("\n"))
            });
        }
    }

    Ok(super::OK)
}
