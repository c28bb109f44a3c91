// `spine schedules` - declarative schedule management

use std::process::ExitCode;

use anyhow::Result;
use clap::Subcommand;

use spine_core::CoreConfig;
use spine_runtime::ScheduleSpec;
use spine_storage::ScheduleStore;

use crate::output::{table, OutputFormat};

#[derive(Subcommand)]
pub enum SchedulesCommand {
    /// List declared schedules
    List,
    /// Create or update a schedule
    Set {
        /// Unique schedule name
        name: String,

        /// Pipeline to fire
        #[arg(long)]
        pipeline: String,

        /// 5-field cron expression (minute hour day month weekday)
        #[arg(long)]
        cron: String,

        /// IANA timezone for the cron expression
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Concurrent outstanding submissions allowed
        #[arg(long, default_value = "1")]
        max_instances: u32,
    },
    /// Enable a schedule
    Enable { name: String },
    /// Disable a schedule
    Disable { name: String },
}

pub async fn run(
    command: SchedulesCommand,
    config: &CoreConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    let runtime = super::runtime(config).await?;

    match command {
        SchedulesCommand::List => {
            let schedules = runtime
                .store
                .list_schedules()
                .await
                .map_err(anyhow::Error::new)?;
            format.emit(&schedules, |schedules| {
                if schedules.is_empty() {
                    return "no schedules declared".to_string();
                }
                table(
                    &["NAME", "PIPELINE", "CRON", "TZ", "ENABLED", "NEXT RUN"],
                    schedules
                        .iter()
                        .map(|s| {
                            vec![
                                s.name.clone(),
                                s.pipeline.clone(),
                                s.cron.clone(),
                                s.timezone.clone(),
                                if s.enabled { "yes" } else { "no" }.to_string(),
                                s.next_run_at
                                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                            ]
                        })
                        .collect(),
                )
            });
        }
        SchedulesCommand::Set {
            name,
            pipeline,
            cron,
            timezone,
            params,
            max_instances,
        } => {
            let params: serde_json::Value = serde_json::from_str(&params)
                .map_err(|e| anyhow::anyhow!("--params must be a JSON object: {e}"))?;

            let scheduler = runtime.scheduler();
            let schedule = scheduler
                .declare(
                    ScheduleSpec::new(name, pipeline, cron)
                        .with_timezone(timezone)
                        .with_params(params)
                        .with_max_instances(max_instances),
                )
                .await
                .map_err(anyhow::Error::new)?;

            format.emit(&schedule, |s| {
                format!(
                    "schedule '{}' set; next run {}",
                    s.name,
                    s.next_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                )
            });
        }
        SchedulesCommand::Enable { name } => {
            let changed = runtime
                .store
                .set_schedule_enabled(&name, true)
                .await
                .map_err(anyhow::Error::new)?;
            if !changed {
                anyhow::bail!(spine_core::SpineError::NotFound(format!("schedule {name}")));
            }
            format.emit(&name, |name| format!("schedule '{name}' enabled"));
        }
        SchedulesCommand::Disable { name } => {
            let changed = runtime
                .store
                .set_schedule_enabled(&name, false)
                .await
                .map_err(anyhow::Error::new)?;
            if !changed {
                anyhow::bail!(spine_core::SpineError::NotFound(format!("schedule {name}")));
            }
            format.emit(&name, |name| format!("schedule '{name}' disabled"));
        }
    }

    Ok(super::OK)
}
