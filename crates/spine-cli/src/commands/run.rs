// `spine run` - submit a pipeline

use std::process::ExitCode;

use anyhow::Result;
use serde_json::Value;

use spine_core::{CoreConfig, ExecutionStatus, Lane, TriggerSource};
use spine_runtime::RunPipeline;

use crate::output::OutputFormat;

/// Parse `key=value` pairs; values that read as JSON scalars keep their type
fn parse_params(raw: &[String]) -> Result<serde_json::Map<String, Value>> {
    let mut params = serde_json::Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("parameter '{pair}' is not key=value"))?;
        let value = match serde_json::from_str::<Value>(value) {
            Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
            _ => Value::String(value.to_string()),
        };
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: &CoreConfig,
    format: OutputFormat,
    name: String,
    params: Vec<String>,
    dry_run: bool,
    lane: String,
    idempotency_key: Option<String>,
) -> Result<ExitCode> {
    let runtime = super::runtime(config).await?;

    let command = RunPipeline {
        name,
        params: parse_params(&params)?,
        lane: lane.parse::<Lane>().map_err(anyhow::Error::new)?,
        trigger_source: TriggerSource::Cli,
        idempotency_key,
        dry_run,
    };

    let response = command
        .execute(&runtime.dispatcher)
        .await
        .map_err(anyhow::Error::new)?;

    let code = match response.status {
        _ if response.dry_run => super::OK,
        Some(ExecutionStatus::Failed) | Some(ExecutionStatus::Cancelled) => ExitCode::from(1),
        _ => super::OK,
    };

    format.emit(&response, |r| {
        if r.dry_run {
            format!(
                "dry run: {} would submit with logical key {}",
                r.pipeline,
                r.logical_key.as_deref().unwrap_or("-"),
            )
        } else {
            let mut out = format!(
                "{} {} ({})",
                r.pipeline,
                r.status.map(|s| s.to_string()).unwrap_or_default(),
                r.execution_id.map(|id| id.to_string()).unwrap_or_default(),
            );
            if let Some(metrics) = &r.metrics {
                out.push_str(&format!("\nmetrics: {metrics}"));
            }
            if let Some(message) = &r.error_message {
                out.push_str(&format!("\nerror: {message}"));
            }
            out
        }
    });

    Ok(code)
}
