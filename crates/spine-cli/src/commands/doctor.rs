// `spine doctor` - health checks

use std::process::ExitCode;

use anyhow::{Context, Result};

use spine_core::CoreConfig;
use spine_runtime::CheckHealth;
use spine_storage::Database;

use crate::output::OutputFormat;

pub async fn run(config: &CoreConfig, format: OutputFormat) -> Result<ExitCode> {
    let db = Database::from_url(&config.database_url)
        .await
        .context("connecting to database")?;

    let report = CheckHealth.execute(&db).await;
    let code = if report.healthy {
        super::OK
    } else {
        ExitCode::from(1)
    };

    format.emit(&report, |r| {
        format!(
            "database: {}\nmigrations applied: {}\nversion: {}\nstatus: {}",
            if r.database { "ok" } else { "unreachable" },
            r.migrations_applied,
            r.version,
            if r.healthy { "healthy" } else { "degraded" },
        )
    });

    Ok(code)
}
