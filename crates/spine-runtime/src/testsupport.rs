//! Shared fixtures for runtime tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use spine_core::{ParamDef, ParamType, Result, SpineError};
use spine_storage::MemoryStore;

use crate::cancel::CancellationRegistry;
use crate::ledger::Ledger;
use crate::pipeline::{Pipeline, PipelineContext, PipelineResult, PipelineSpec};
use crate::registry::PipelineRegistry;
use crate::retry::RetryPolicy;
use crate::runner::PipelineRunner;

/// Pipeline that always succeeds with fixed metrics
pub struct NoopPipeline {
    name: String,
}

#[async_trait]
impl Pipeline for NoopPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> PipelineSpec {
        PipelineSpec::new(&self.name)
            .with_description("test pipeline that writes nothing")
            .with_optional(ParamDef::optional("week_ending", ParamType::Date))
            .with_optional(ParamDef::optional("tier", ParamType::String))
    }

    async fn run(
        &self,
        _params: &BTreeMap<String, Value>,
        _ctx: &PipelineContext,
    ) -> Result<PipelineResult> {
        Ok(PipelineResult::new()
            .with_metric("records", 3)
            .with_metric("inserted", 3))
    }
}

/// Pipeline that fails with a TRANSIENT error for its first `fail_times`
/// invocations, then succeeds
pub struct FlakyPipeline {
    name: String,
    fail_times: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Pipeline for FlakyPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> PipelineSpec {
        PipelineSpec::new(&self.name)
    }

    async fn run(
        &self,
        _params: &BTreeMap<String, Value>,
        _ctx: &PipelineContext,
    ) -> Result<PipelineResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Err(SpineError::network("connection reset by peer"))
        } else {
            Ok(PipelineResult::new().with_metric("records", 1))
        }
    }
}

pub fn register_noop(registry: &PipelineRegistry, name: &str) {
    registry.register(Arc::new(NoopPipeline {
        name: name.to_string(),
    }));
}

pub fn register_flaky(registry: &PipelineRegistry, name: &str, fail_times: u32) {
    registry.register(Arc::new(FlakyPipeline {
        name: name.to_string(),
        fail_times,
        calls: AtomicU32::new(0),
    }));
}

/// Runner + ledger over a fresh MemoryStore, with fast backoff for tests
pub fn test_runner(
    setup: impl FnOnce(&PipelineRegistry),
) -> (Arc<PipelineRunner>, Ledger, Arc<PipelineRegistry>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(PipelineRegistry::new());
    setup(&registry);

    let runner = Arc::new(PipelineRunner::new(
        registry.clone(),
        store.clone(),
        Arc::new(CancellationRegistry::new()),
        None,
        Duration::from_secs(3600),
        RetryPolicy::exponential()
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0),
    ));
    let ledger = Ledger::new(store);
    (runner, ledger, registry)
}
