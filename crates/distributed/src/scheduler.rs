//! Split scheduler for source-distributed stages.
//!
//! Driving model:
//! - one logical driver calls [`SourcePartitionedScheduler::schedule`] repeatedly
//!   until the result reports `finished`;
//! - between calls the driver should await the returned `blocked` future;
//!   calling early is allowed and yields the same blocked state.
//!
//! Per call the scheduler:
//! - creates the dynamic-filter collecting task on its first call when the
//!   fragment needs one and no task exists yet;
//! - fetches at most one split batch, unless splits from an earlier batch are
//!   still waiting for capacity;
//! - routes splits through the placement policy and creates tasks lazily;
//! - reports finish on the first call that finds the source exhausted with
//!   nothing left to place and no work done.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use sift_common::metrics::global_metrics;
use sift_common::{QueryId, Result, SchedulerConfig, SiftError};
use tracing::{debug, info, warn};

use crate::filter_service::DynamicFilterService;
use crate::nodes::NodeManager;
use crate::placement::DynamicSplitPlacementPolicy;
use crate::signal;
use crate::split_source::{SplitBatch, SplitSource};
use crate::stage::StageExecution;
use crate::task::{RemoteTask, Split};

/// Reports whether the consuming stage's output buffer is over-utilized.
pub type BufferUtilization = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initialized,
    SplitsAdded,
    /// Source exhausted and every split placed.
    NoMoreSplits,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    /// Every candidate node or task is at capacity.
    SplitQueuesFull,
    /// The split source has no batch ready.
    WaitingForSource,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::SplitQueuesFull => "split_queues_full",
            BlockedReason::WaitingForSource => "waiting_for_source",
        }
    }
}

pub struct ScheduleResult {
    pub new_tasks: Vec<Arc<dyn RemoteTask>>,
    pub splits_scheduled: usize,
    /// Resolves when calling `schedule` again can make progress.
    pub blocked: BoxFuture<'static, ()>,
    pub blocked_reason: Option<BlockedReason>,
    pub finished: bool,
}

impl ScheduleResult {
    fn finished() -> Self {
        Self {
            new_tasks: Vec::new(),
            splits_scheduled: 0,
            blocked: signal::resolved(),
            blocked_reason: None,
            finished: true,
        }
    }
}

impl std::fmt::Debug for ScheduleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleResult")
            .field("new_tasks", &self.new_tasks.len())
            .field("splits_scheduled", &self.splits_scheduled)
            .field("blocked_reason", &self.blocked_reason)
            .field("finished", &self.finished)
            .finish()
    }
}

type BatchFetch = Shared<BoxFuture<'static, Arc<Result<SplitBatch>>>>;

pub struct SourcePartitionedScheduler {
    query_id: QueryId,
    stage: StageExecution,
    split_source: Box<dyn SplitSource>,
    placement: DynamicSplitPlacementPolicy,
    filter_service: Arc<DynamicFilterService>,
    buffer_over_utilized: BufferUtilization,
    split_batch_size: usize,
    state: SchedulerState,
    pending_splits: Vec<Split>,
    next_batch: Option<BatchFetch>,
    source_exhausted: bool,
    collecting_task_checked: bool,
}

impl SourcePartitionedScheduler {
    pub fn new(
        stage: StageExecution,
        split_source: Box<dyn SplitSource>,
        node_manager: Arc<dyn NodeManager>,
        filter_service: Arc<DynamicFilterService>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let placement = DynamicSplitPlacementPolicy::new(
            node_manager,
            Arc::clone(stage.node_task_map()),
            config.clone(),
            split_source.catalog().map(str::to_string),
        );
        Ok(Self {
            query_id: stage.stage_id().query_id,
            stage,
            split_source,
            placement,
            filter_service,
            buffer_over_utilized: Arc::new(|| false),
            split_batch_size: config.split_batch_size,
            state: SchedulerState::Initialized,
            pending_splits: Vec::new(),
            next_batch: None,
            source_exhausted: false,
            collecting_task_checked: false,
        })
    }

    pub fn with_buffer_utilization(mut self, buffer_over_utilized: BufferUtilization) -> Self {
        self.buffer_over_utilized = buffer_over_utilized;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stage(&self) -> &StageExecution {
        &self.stage
    }

    /// Fetched splits still waiting for node capacity.
    pub fn pending_split_count(&self) -> usize {
        self.pending_splits.len()
    }

    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        if matches!(
            self.state,
            SchedulerState::Finished | SchedulerState::Aborted
        ) {
            return Ok(ScheduleResult::finished());
        }
        let stage_id = self.stage.stage_id();
        let mut new_tasks = Vec::new();

        if !self.collecting_task_checked {
            self.collecting_task_checked = true;
            if self.stage.task_count() == 0
                && self
                    .filter_service
                    .is_collecting_task_needed(self.query_id, self.stage.fragment())
            {
                let node = self.placement.choose_node_for_task()?;
                if let Some(task) = self.stage.schedule_splits(&node, Vec::new())? {
                    info!(
                        query_id = %self.query_id,
                        stage_id = %stage_id,
                        task_id = %task.task_id(),
                        node_id = %node.node_id,
                        operator = "SourcePartitionedScheduler",
                        "dynamic filter collecting task created"
                    );
                    new_tasks.push(task);
                }
            }
        }

        let mut waiting_for_source = None;
        if self.pending_splits.is_empty() && !self.source_exhausted {
            let batch_size = self.split_batch_size;
            let source = &mut self.split_source;
            let fetch = self
                .next_batch
                .get_or_insert_with(|| source.next_batch(batch_size).map(Arc::new).boxed().shared())
                .clone();
            match fetch.clone().now_or_never() {
                Some(result) => {
                    self.next_batch = None;
                    match &*result {
                        Ok(batch) => {
                            self.pending_splits.extend(batch.splits.iter().cloned());
                            self.source_exhausted = batch.last_batch;
                            if self.state == SchedulerState::Initialized {
                                self.state = SchedulerState::SplitsAdded;
                            }
                        }
                        Err(e) => {
                            return Err(SiftError::Execution(format!(
                                "split source for stage {stage_id} failed: {e}"
                            )));
                        }
                    }
                }
                None => waiting_for_source = Some(fetch.map(|_| ()).boxed()),
            }
        }

        let mut splits_scheduled = 0;
        let mut queues_full = None;
        if !self.pending_splits.is_empty() {
            // With no task yet the stage would never start, so buffer pressure is ignored.
            let allow_new_tasks = self.stage.task_count() == 0 || !(self.buffer_over_utilized)();
            let placement = self.placement.compute_assignments(
                &self.pending_splits,
                self.stage.tasks(),
                allow_new_tasks,
            )?;
            for (node, splits) in placement.assignments {
                let count = splits.len();
                if let Some(task) = self.stage.schedule_splits(&node, splits)? {
                    new_tasks.push(task);
                }
                splits_scheduled += count;
            }
            self.pending_splits = placement.unassigned;
            if !self.pending_splits.is_empty() {
                queues_full = Some(placement.blocked);
            }
        }

        if splits_scheduled > 0 || !new_tasks.is_empty() {
            global_metrics().record_schedule(
                self.query_id.0,
                stage_id.id,
                splits_scheduled as u64,
                new_tasks.len() as u64,
            );
        }

        if let Some(blocked) = queues_full {
            return Ok(self.blocked(
                new_tasks,
                splits_scheduled,
                blocked,
                BlockedReason::SplitQueuesFull,
            ));
        }
        if let Some(blocked) = waiting_for_source {
            // The source may be waiting on filters that only this stage can produce.
            self.filter_service
                .unblock_stage_dynamic_filters(self.query_id, self.stage.fragment());
            return Ok(self.blocked(
                new_tasks,
                splits_scheduled,
                blocked,
                BlockedReason::WaitingForSource,
            ));
        }

        if self.source_exhausted && self.pending_splits.is_empty() {
            if self.state != SchedulerState::NoMoreSplits {
                self.state = SchedulerState::NoMoreSplits;
                self.stage.no_more_splits();
                self.filter_service
                    .stage_cannot_schedule_more_tasks(stage_id, self.stage.task_count());
            }
            if splits_scheduled == 0 && new_tasks.is_empty() {
                self.state = SchedulerState::Finished;
                self.split_source.close();
                info!(
                    query_id = %self.query_id,
                    stage_id = %stage_id,
                    tasks = self.stage.task_count(),
                    splits = self.stage.splits_scheduled(),
                    operator = "SourcePartitionedScheduler",
                    "stage scheduling finished"
                );
                return Ok(ScheduleResult::finished());
            }
        }

        Ok(ScheduleResult {
            new_tasks,
            splits_scheduled,
            blocked: signal::resolved(),
            blocked_reason: None,
            finished: false,
        })
    }

    fn blocked(
        &self,
        new_tasks: Vec<Arc<dyn RemoteTask>>,
        splits_scheduled: usize,
        blocked: BoxFuture<'static, ()>,
        reason: BlockedReason,
    ) -> ScheduleResult {
        debug!(
            query_id = %self.query_id,
            stage_id = %self.stage.stage_id(),
            reason = reason.as_str(),
            pending_splits = self.pending_splits.len(),
            operator = "SourcePartitionedScheduler",
            "stage scheduling blocked"
        );
        global_metrics().inc_scheduler_blocked(
            self.query_id.0,
            self.stage.stage_id().id,
            reason.as_str(),
        );
        ScheduleResult {
            new_tasks,
            splits_scheduled,
            blocked,
            blocked_reason: Some(reason),
            finished: false,
        }
    }

    /// Cancels the in-flight fetch and drops placement state.
    /// Filters already published stay valid.
    pub fn abort(&mut self) {
        if self.state == SchedulerState::Aborted {
            return;
        }
        self.next_batch = None;
        self.split_source.close();
        let dropped = self.pending_splits.len();
        self.pending_splits.clear();
        self.stage.abort();
        self.state = SchedulerState::Aborted;
        warn!(
            query_id = %self.query_id,
            stage_id = %self.stage.stage_id(),
            dropped_splits = dropped,
            operator = "SourcePartitionedScheduler",
            "stage scheduling aborted"
        );
    }
}

impl std::fmt::Debug for SourcePartitionedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePartitionedScheduler")
            .field("stage_id", &self.stage.stage_id())
            .field("state", &self.state)
            .field("pending_splits", &self.pending_splits.len())
            .field("source_exhausted", &self.source_exhausted)
            .finish()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
