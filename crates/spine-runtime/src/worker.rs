//! Worker pool for async-mode execution
//!
//! Stateless, interchangeable workers coordinated through the database:
//! the poll loop leases ready executions (SKIP LOCKED underneath), the
//! heartbeat loop keeps leases fresh, and the recovery loop fails
//! stale-leased executions and re-queues the retryable ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use spine_core::{Lane, Result, SpineError};
use spine_storage::LedgerStore;

use crate::ledger::Ledger;
use crate::retry::RetryPolicy;
use crate::runner::PipelineRunner;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent executions
    pub max_concurrency: usize,

    /// Slots reserved from the pool for the backfill lane
    pub backfill_slots: usize,

    /// Poll interval when the queue is empty
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Heartbeat interval for leased executions
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Stale-lease recovery sweep interval
    #[serde(with = "duration_millis")]
    pub recovery_interval: Duration,

    /// A running execution without a heartbeat for this long is stale
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let max_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency,
            backfill_slots: (max_concurrency / 4).max(1),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self.backfill_slots = (self.max_concurrency / 4).max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

/// Worker pool driving leased executions through the pipeline runtime
pub struct WorkerPool {
    runner: Arc<PipelineRunner>,
    ledger: Ledger,
    config: WorkerPoolConfig,
    active: Arc<Mutex<HashSet<Uuid>>>,
    permits: Arc<Semaphore>,
    backfill_permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(runner: Arc<PipelineRunner>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ledger = runner.ledger().clone();
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            backfill_permits: Arc::new(Semaphore::new(config.backfill_slots)),
            runner,
            ledger,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Start the poll, heartbeat and recovery loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            backfill_slots = self.config.backfill_slots,
            "starting worker pool"
        );

        // Crash recovery pass before accepting new work
        self.recover_stale().await?;

        let mut handles = self.handles.lock();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_recovery_loop());
        Ok(())
    }

    /// Graceful shutdown: stop leasing, wait for in-flight executions
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.permits.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - self.permits.available_permits(),
                    "shutdown timeout reached with executions still running"
                );
                return Err(SpineError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    /// One recovery sweep: fail stale-leased executions, retry the retryable
    pub async fn recover_stale(&self) -> Result<usize> {
        Self::sweep_stale(&self.ledger, self.config.heartbeat_timeout).await
    }

    /// Shared sweep body: the startup pass and the recurring recovery loop
    /// both run exactly this.
    async fn sweep_stale(ledger: &Ledger, heartbeat_timeout: Duration) -> Result<usize> {
        let stale = ledger.store().stale_executions(heartbeat_timeout).await?;

        let mut recovered = 0;
        for execution in stale {
            let error = SpineError::orchestration(format!(
                "stale_lease: no heartbeat from {} since {:?}",
                execution.locked_by.as_deref().unwrap_or("unknown"),
                execution.heartbeat_at
            ));
            match ledger.fail(execution.id, &error).await {
                Ok(failed) => {
                    recovered += 1;
                    // Stale leases are infrastructure failures, retry them
                    // regardless of the recorded kind while attempts remain.
                    if failed.retry_count < failed.max_retries {
                        let transient = SpineError::network("stale lease recovery");
                        if let Err(e) = ledger
                            .dispose_failure(&failed, &transient, &RetryPolicy::exponential())
                            .await
                        {
                            error!(execution_id = %failed.id, "failed to schedule recovery retry: {e}");
                        }
                    }
                }
                Err(e) => {
                    debug!(execution_id = %execution.id, "stale execution moved on: {e}");
                }
            }
        }

        if recovered > 0 {
            warn!(count = recovered, "recovered stale-leased executions");
        }
        Ok(recovered)
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let ledger = self.ledger.clone();
        let config = self.config.clone();
        let active = self.active.clone();
        let permits = self.permits.clone();
        let backfill_permits = self.backfill_permits.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    // Saturated; wait for capacity or shutdown
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => continue,
                        _ = shutdown_rx.changed() => continue,
                    }
                };

                // Backfill runs on a bounded slice of the pool; when its
                // slots are gone, lease only the other lanes.
                let backfill_permit = backfill_permits.clone().try_acquire_owned().ok();
                let lanes: Vec<Lane> = if backfill_permit.is_some() {
                    vec![Lane::Realtime, Lane::Normal, Lane::Backfill]
                } else {
                    vec![Lane::Realtime, Lane::Normal]
                };

                match ledger
                    .store()
                    .lease_next(&config.worker_id, &lanes)
                    .await
                {
                    Ok(Some(execution)) => {
                        let backfill_permit =
                            if execution.lane == Lane::Backfill { backfill_permit } else { None };
                        active.lock().insert(execution.id);

                        let runner = runner.clone();
                        let active = active.clone();
                        let execution_id = execution.id;
                        tokio::spawn(async move {
                            if let Err(e) = runner.run_execution(execution).await {
                                error!(%execution_id, "execution driver error: {e}");
                            }
                            active.lock().remove(&execution_id);
                            drop(backfill_permit);
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        drop(backfill_permit);
                        tokio::select! {
                            _ = tokio::time::sleep(config.poll_interval) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        drop(backfill_permit);
                        error!("lease poll error: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(config.poll_interval) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                }
            }
            debug!("poll loop exited");
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let active = self.active.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ids: Vec<Uuid> = active.lock().iter().copied().collect();
                        for id in ids {
                            match ledger.store().heartbeat(id, &worker_id).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    // Lease lost (cancelled or reclaimed)
                                    debug!(execution_id = %id, "heartbeat rejected");
                                }
                                Err(e) => error!(execution_id = %id, "heartbeat failed: {e}"),
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("heartbeat loop exited");
        })
    }

    fn spawn_recovery_loop(&self) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.recovery_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::sweep_stale(&ledger, config.heartbeat_timeout).await {
                            error!("stale recovery sweep failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("recovery loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("recovery loop exited");
        })
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{register_noop, test_runner};
    use serde_json::json;
    use spine_core::ExecutionStatus;
    use spine_storage::models::NewExecution;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert!(config.max_concurrency >= 1);
        assert!(config.backfill_slots >= 1);
        assert!(config.backfill_slots <= config.max_concurrency);
    }

    #[tokio::test]
    async fn test_pool_drains_queued_work() {
        let (runner, ledger, _registry) = test_runner(|r| register_noop(r, "noop"));
        let pool = WorkerPool::new(
            runner,
            WorkerPoolConfig::default()
                .with_worker_id("test-worker")
                .with_poll_interval(Duration::from_millis(10)),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let execution = ledger
                .admit(NewExecution::new("noop", json!({})))
                .await
                .unwrap();
            ids.push(ledger.mark_queued(execution.id).await.unwrap().id);
        }

        pool.start().await.unwrap();

        // Wait for all three to reach terminal state
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut done = 0;
            for id in &ids {
                if ledger.get(*id).await.unwrap().status.is_terminal() {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
        }

        for id in &ids {
            assert_eq!(
                ledger.get(*id).await.unwrap().status,
                ExecutionStatus::Completed
            );
        }

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_stale_marks_failed_and_retries() {
        let (runner, ledger, _registry) = test_runner(|r| register_noop(r, "noop"));
        let pool = WorkerPool::new(
            runner,
            WorkerPoolConfig::default()
                .with_worker_id("w1")
                .with_heartbeat_timeout(Duration::from_secs(0)),
        );

        // Lease a row, then never heartbeat: with a zero timeout it is
        // immediately stale.
        let execution = ledger
            .admit(NewExecution::new("noop", json!({})))
            .await
            .unwrap();
        ledger.mark_queued(execution.id).await.unwrap();
        let leased = ledger
            .store()
            .lease_next("dead-worker", &[Lane::Normal])
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let recovered = pool.recover_stale().await.unwrap();
        assert_eq!(recovered, 1);

        let failed = ledger.get(leased.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("ORCHESTRATION"));
        assert!(failed
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("orchestration error: stale_lease"));

        // A retry execution was chained
        let events = ledger.store().list_events(leased.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == crate::ledger::events::RETRY_SCHEDULED));
    }
}
