//! Runtime assembly
//!
//! One place wires the store, registry, executor and services from config so
//! the API server and the CLI build identical runtimes. The executor is
//! selected here by capability flag; sync and async never mix.

use std::sync::Arc;

use spine_core::{Capabilities, CoreConfig, Result, SpineError, TierDateNormalizer};
use spine_storage::{CoreStore, Database, PostgresStore};

use crate::cancel::CancellationRegistry;
use crate::dispatcher::Dispatcher;
use crate::dlq::DlqService;
use crate::executor::create_executor;
use crate::registry::PipelineRegistry;
use crate::retry::RetryPolicy;
use crate::runner::PipelineRunner;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::worker::{WorkerPool, WorkerPoolConfig};
use crate::workflow::{WorkflowRegistry, WorkflowRunner};

/// A fully wired orchestration runtime
pub struct Runtime {
    pub config: CoreConfig,
    pub capabilities: Capabilities,
    pub db: Database,
    pub store: Arc<dyn CoreStore>,
    pub registry: Arc<PipelineRegistry>,
    pub workflows: Arc<WorkflowRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub runner: Arc<PipelineRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub dlq: Arc<DlqService>,
    pub workflow_runner: Arc<WorkflowRunner>,
}

impl Runtime {
    /// Connect to the database and assemble the runtime for the configured
    /// tier. Pipelines are registered afterwards, explicitly, by the caller.
    pub async fn connect(config: CoreConfig) -> Result<Self> {
        let db = Database::from_url_with_pool_size(
            &config.database_url,
            (config.worker_concurrency as u32 + 4).max(8),
        )
        .await
        .map_err(|e| SpineError::Database(e.to_string()))?;

        let store: Arc<dyn CoreStore> = Arc::new(PostgresStore::new(db.pool().clone()));
        Ok(Self::assemble(config, db, store))
    }

    /// Assemble over an existing store (tests use the memory store)
    pub fn assemble(config: CoreConfig, db: Database, store: Arc<dyn CoreStore>) -> Self {
        let capabilities = Capabilities::for_tier(config.tier);
        let registry = Arc::new(PipelineRegistry::new());
        let workflows = Arc::new(WorkflowRegistry::new());
        let cancellations = Arc::new(CancellationRegistry::new());

        let runner = Arc::new(PipelineRunner::new(
            registry.clone(),
            store.clone(),
            cancellations.clone(),
            Some(db.clone()),
            config.execution_timeout,
            RetryPolicy::exponential(),
        ));

        let executor = create_executor(capabilities, runner.clone(), cancellations.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            runner.ledger().clone(),
            executor,
            cancellations.clone(),
            Arc::new(TierDateNormalizer),
        ));
        let dlq = Arc::new(DlqService::new(store.clone(), dispatcher.clone()));
        let workflow_runner = Arc::new(WorkflowRunner::new(
            store.clone(),
            dispatcher.clone(),
            workflows.clone(),
        ));

        Self {
            config,
            capabilities,
            db,
            store,
            registry,
            workflows,
            cancellations,
            runner,
            dispatcher,
            dlq,
            workflow_runner,
        }
    }

    /// Worker pool for the async tiers, configured from the runtime config
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.runner.clone(),
            WorkerPoolConfig::default()
                .with_max_concurrency(self.config.worker_concurrency)
                .with_heartbeat_timeout(self.config.heartbeat_timeout),
        )
    }

    /// Scheduler for the full tier
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.dispatcher.clone(),
            SchedulerConfig {
                tick_interval: self.config.scheduler_interval,
                ..SchedulerConfig::default()
            },
        )
    }
}
