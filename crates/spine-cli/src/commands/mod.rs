pub mod db;
pub mod dlq;
pub mod doctor;
pub mod pipelines;
pub mod run;
pub mod schedules;

use std::process::ExitCode;

use anyhow::Result;

use spine_core::CoreConfig;
use spine_runtime::Runtime;

/// Build the runtime and register the linked pipelines
pub async fn runtime(config: &CoreConfig) -> Result<Runtime> {
    let runtime = Runtime::connect(config.clone()).await?;
    crate::pipelines::register_pipelines(&runtime.registry);
    Ok(runtime)
}

pub const OK: ExitCode = ExitCode::SUCCESS;
