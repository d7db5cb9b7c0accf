//! Scheduler for table-scan stages.
//!
//! Pulls split batches from the connector and places them on whichever nodes
//! have queue capacity, creating tasks lazily on first placement. Applies
//! backpressure in two directions: it stops placing splits while any
//! downstream task reports a full output buffer, and it reports
//! `SplitQueuesFull` when no node can take more splits.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use skiff_error::{DbError, ErrorCode, Result};
use tracing::debug;

use crate::node::DynamicSplitPlacement;
use crate::plan::PlanNodeId;
use crate::scheduler::result::{BlockedReason, ScheduleResult};
use crate::split::{Split, SplitFetch, SplitSource};
use crate::stage::StageExecution;

pub type ChildBlockedProbe = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct SourcePartitionedScheduler {
    stage: Arc<StageExecution>,
    source_node: PlanNodeId,
    split_source: Box<dyn SplitSource>,
    placement: DynamicSplitPlacement,
    split_batch_size: usize,
    pending: Vec<Split>,
    no_more_splits: bool,
    finished: bool,
    /// True when any task downstream of this stage has a full output buffer.
    any_child_task_blocked: ChildBlockedProbe,
    blocked_retry_wait: Duration,
}

impl SourcePartitionedScheduler {
    pub fn new(
        stage: Arc<StageExecution>,
        source_node: PlanNodeId,
        split_source: Box<dyn SplitSource>,
        placement: DynamicSplitPlacement,
        split_batch_size: usize,
        any_child_task_blocked: ChildBlockedProbe,
        blocked_retry_wait: Duration,
    ) -> Self {
        SourcePartitionedScheduler {
            stage,
            source_node,
            split_source,
            placement,
            split_batch_size,
            pending: Vec::new(),
            no_more_splits: false,
            finished: false,
            any_child_task_blocked,
            blocked_retry_wait,
        }
    }

    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.finished {
            return Ok(ScheduleResult::non_blocked(true, Vec::new(), 0));
        }

        // Placing more splits while downstream buffers are full only piles
        // work onto stuck tasks.
        if (self.any_child_task_blocked)() {
            let wait = tokio::time::sleep(self.blocked_retry_wait).boxed();
            return Ok(ScheduleResult::blocked(
                Vec::new(),
                0,
                wait,
                BlockedReason::SplitQueuesFull,
            ));
        }

        if self.pending.is_empty() && !self.no_more_splits {
            match self.split_source.fetch_next_batch(self.split_batch_size)? {
                SplitFetch::Ready(batch) => {
                    self.pending.extend(batch.splits);
                    self.no_more_splits = batch.no_more_splits || self.split_source.is_finished();
                }
                SplitFetch::Pending(fut) => {
                    return Ok(ScheduleResult::blocked(
                        Vec::new(),
                        0,
                        fut,
                        BlockedReason::WaitingForSource,
                    ));
                }
            }
        }

        let mut new_tasks = Vec::new();
        let mut splits_scheduled = 0;

        if !self.pending.is_empty() {
            let splits = std::mem::take(&mut self.pending);
            let placed = self.placement.compute_assignments(splits)?;
            for (node, node_splits) in placed.assignments {
                let scheduled =
                    self.stage
                        .schedule_splits(&node, self.source_node, node_splits)?;
                new_tasks.extend(scheduled.new_tasks);
                splits_scheduled += scheduled.split_count;
            }
            if !placed.unplaced.is_empty() {
                debug!(
                    stage_id = %self.stage.stage_id(),
                    unplaced = placed.unplaced.len(),
                    "split queues full"
                );
                self.pending = placed.unplaced;
                let wait = tokio::time::sleep(self.blocked_retry_wait).boxed();
                return Ok(ScheduleResult::blocked(
                    new_tasks,
                    splits_scheduled,
                    wait,
                    BlockedReason::SplitQueuesFull,
                ));
            }
        }

        if self.no_more_splits && self.pending.is_empty() {
            // A scan that produced no splits still needs one task so the
            // stage produces an (empty) result for its consumers.
            if !self.stage.has_tasks() {
                let node = self
                    .placement
                    .nodes()
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        DbError::new("No worker nodes available")
                            .with_code(ErrorCode::NoNodesAvailable)
                    })?;
                let task = self.stage.schedule_task(&node, 0)?;
                new_tasks.push(task);
            }
            self.stage.no_more_splits(self.source_node);
            self.split_source.close();
            self.finished = true;
            return Ok(ScheduleResult::non_blocked(true, new_tasks, splits_scheduled));
        }

        Ok(ScheduleResult::non_blocked(false, new_tasks, splits_scheduled))
    }

    pub fn close(&mut self) {
        self.split_source.close();
    }
}

impl std::fmt::Debug for SourcePartitionedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePartitionedScheduler")
            .field("stage_id", &self.stage.stage_id())
            .field("source_node", &self.source_node)
            .field("pending", &self.pending.len())
            .field("no_more_splits", &self.no_more_splits)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
