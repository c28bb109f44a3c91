//! Backfill planning
//!
//! A BackfillPlan describes a range of weekly partitions to re-ingest.
//! Planning expands the range into work items; execution submits each item
//! on the backfill lane, where the worker pool bounds its parallelism.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use spine_core::{BackfillStatus, Lane, Result, SpineError, TriggerSource, WorkItemStatus};
use spine_storage::models::{BackfillPlan, NewBackfillPlan};
use spine_storage::{BookkeepingStore, CoreStore};

use crate::dispatcher::{Dispatcher, SubmitRequest};

/// Week-ending dates (Fridays) covering `[start, end]`
pub fn week_endings(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    // First Friday at or after start
    let mut cursor = start;
    while cursor.weekday() != Weekday::Fri {
        cursor += chrono::Duration::days(1);
    }

    let mut weeks = Vec::new();
    while cursor <= end {
        weeks.push(cursor);
        cursor += chrono::Duration::weeks(1);
    }
    weeks
}

/// Expands backfill plans into work items and drives their submission
pub struct BackfillPlanner {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
}

impl BackfillPlanner {
    pub fn new(store: Arc<dyn CoreStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Create a plan and enqueue one work item per weekly partition
    #[instrument(skip(self))]
    pub async fn plan(
        &self,
        domain: &str,
        pipeline: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<BackfillPlan> {
        if end_date < start_date {
            return Err(SpineError::validation(format!(
                "backfill range is inverted: {start_date} > {end_date}"
            )));
        }

        let plan = self
            .store
            .insert_backfill_plan(NewBackfillPlan {
                domain: domain.to_string(),
                workflow: pipeline.to_string(),
                start_date,
                end_date,
                lane: Lane::Backfill,
            })
            .await?;

        let weeks = week_endings(start_date, end_date);
        for week in &weeks {
            self.store
                .enqueue_work_item(
                    domain,
                    pipeline,
                    &format!("week_ending={}", week.format("%Y-%m-%d")),
                )
                .await?;
        }
        self.store
            .record_backfill_progress(plan.plan_id, weeks.len() as u32, 0)
            .await?;

        info!(plan_id = %plan.plan_id, weeks = weeks.len(), "backfill planned");
        self.store
            .get_backfill_plan(plan.plan_id)
            .await?
            .ok_or_else(|| SpineError::NotFound(format!("backfill plan {}", plan.plan_id)))
    }

    /// Submit every pending work item of a plan on the backfill lane.
    ///
    /// A live duplicate (the partition is already being processed) counts as
    /// progress, not failure.
    #[instrument(skip(self))]
    pub async fn execute(&self, plan_id: Uuid) -> Result<BackfillPlan> {
        let plan = self
            .store
            .get_backfill_plan(plan_id)
            .await?
            .ok_or_else(|| SpineError::NotFound(format!("backfill plan {plan_id}")))?;

        self.store
            .update_backfill_status(plan_id, BackfillStatus::Running)
            .await?;

        let items = self
            .store
            .list_work_items(&plan.domain, Some(WorkItemStatus::Pending))
            .await?;
        let mut completed = 0u32;
        let mut failed = 0u32;

        for item in items.iter().filter(|i| i.workflow == plan.workflow) {
            self.store
                .transition_work_item(item.id, WorkItemStatus::InProgress, None)
                .await?;

            let week_ending = item
                .partition_key
                .strip_prefix("week_ending=")
                .unwrap_or(&item.partition_key);
            let request = SubmitRequest::new(&plan.workflow)
                .with_param("week_ending", week_ending)
                .with_lane(Lane::Backfill)
                .with_trigger(TriggerSource::Backfill);

            match self.dispatcher.submit(request).await {
                Ok(_) | Err(SpineError::DuplicateLogicalKey(_)) => {
                    self.store
                        .transition_work_item(item.id, WorkItemStatus::Completed, None)
                        .await?;
                    completed += 1;
                }
                Err(e) => {
                    warn!(plan_id = %plan_id, partition = %item.partition_key, "backfill item failed: {e}");
                    self.store
                        .transition_work_item(
                            item.id,
                            WorkItemStatus::Failed,
                            Some(e.to_string()),
                        )
                        .await?;
                    failed += 1;
                }
            }

            self.store
                .record_backfill_progress(plan_id, plan.items_total, completed)
                .await?;
        }

        let status = if failed > 0 {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Completed
        };
        self.store.update_backfill_status(plan_id, status).await?;

        self.store
            .get_backfill_plan(plan_id)
            .await?
            .ok_or_else(|| SpineError::NotFound(format!("backfill plan {plan_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationRegistry;
    use crate::executor::InlineExecutor;
    use crate::testsupport::{register_noop, test_runner};
    use spine_core::TierDateNormalizer;

    fn fixture() -> (BackfillPlanner, Arc<dyn CoreStore>) {
        let (runner, ledger, registry) = test_runner(|r| register_noop(r, "finra.ingest"));
        let store = ledger.store().clone();
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(InlineExecutor::new(runner, cancellations.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        ));
        (BackfillPlanner::new(store.clone(), dispatcher), store)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_week_endings_are_fridays() {
        let weeks = week_endings(date(2025, 12, 1), date(2025, 12, 31));
        assert_eq!(
            weeks,
            vec![
                date(2025, 12, 5),
                date(2025, 12, 12),
                date(2025, 12, 19),
                date(2025, 12, 26),
            ]
        );
        assert!(weeks.iter().all(|w| w.weekday() == Weekday::Fri));
    }

    #[tokio::test]
    async fn test_plan_enqueues_work_items() {
        let (planner, store) = fixture();
        let plan = planner
            .plan(
                "finra.otc",
                "finra.ingest",
                date(2025, 12, 1),
                date(2025, 12, 31),
            )
            .await
            .unwrap();

        assert_eq!(plan.items_total, 4);
        assert_eq!(plan.status, BackfillStatus::Pending);

        let items = store.list_work_items("finra.otc", None).await.unwrap();
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_execute_submits_and_completes() {
        let (planner, store) = fixture();
        let plan = planner
            .plan(
                "finra.otc",
                "finra.ingest",
                date(2025, 12, 15),
                date(2025, 12, 31),
            )
            .await
            .unwrap();

        let done = planner.execute(plan.plan_id).await.unwrap();
        assert_eq!(done.status, BackfillStatus::Completed);
        assert_eq!(done.items_completed, done.items_total);

        let pending = store
            .list_work_items("finra.otc", Some(WorkItemStatus::Pending))
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_inverted_range_rejected() {
        let (planner, _store) = fixture();
        let err = planner
            .plan(
                "finra.otc",
                "finra.ingest",
                date(2025, 12, 31),
                date(2025, 12, 1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), spine_core::ErrorKind::Validation);
    }
}
