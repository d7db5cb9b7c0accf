//! Scheduler for stages that combine bucketed table scans with remote
//! sources.
//!
//! Task placement is fixed up front, one task per node of the stage's
//! partition map. Splits are routed by bucket to the node owning the bucket.
//! Under grouped execution buckets are processed a bounded number of groups
//! at a time so per-group state on the workers stays small.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use skiff_error::Result;

use crate::node::{BucketNodeMap, ConnectorPartitionHandle, WorkerNode};
use crate::plan::PlanNodeId;
use crate::scheduler::result::{BlockedReason, ScheduleResult};
use crate::split::{Split, SplitFetch, SplitSource};
use crate::stage::StageExecution;
use crate::task::RemoteTask;

struct SourceState {
    source: PlanNodeId,
    split_source: Box<dyn SplitSource>,
    pending: Vec<Split>,
    exhausted: bool,
}

struct GroupState {
    handle: ConnectorPartitionHandle,
    done: bool,
}

pub struct FixedSourcePartitionedScheduler {
    stage: Arc<StageExecution>,
    nodes: Vec<WorkerNode>,
    bucket_node_map: BucketNodeMap,
    sources: Vec<SourceState>,
    groups: Vec<GroupState>,
    /// Upper bound on concurrently active execution groups.
    max_active_groups: usize,
    split_batch_size: usize,
    tasks_created: bool,
    finished: bool,
    blocked_retry_wait: Duration,
    /// Cursor for splits without a bucket, spread round-robin.
    unbucketed_cursor: usize,
}

impl FixedSourcePartitionedScheduler {
    pub fn new(
        stage: Arc<StageExecution>,
        nodes: Vec<WorkerNode>,
        bucket_node_map: BucketNodeMap,
        split_sources: Vec<(PlanNodeId, Box<dyn SplitSource>)>,
        partition_handles: Vec<ConnectorPartitionHandle>,
        concurrent_groups_per_node: usize,
        split_batch_size: usize,
        blocked_retry_wait: Duration,
    ) -> Self {
        let max_active_groups = concurrent_groups_per_node.max(1) * nodes.len().max(1);
        FixedSourcePartitionedScheduler {
            stage,
            nodes,
            bucket_node_map,
            sources: split_sources
                .into_iter()
                .map(|(source, split_source)| SourceState {
                    source,
                    split_source,
                    pending: Vec::new(),
                    exhausted: false,
                })
                .collect(),
            groups: partition_handles
                .into_iter()
                .map(|handle| GroupState {
                    handle,
                    done: false,
                })
                .collect(),
            max_active_groups,
            split_batch_size,
            tasks_created: false,
            finished: false,
            blocked_retry_wait,
            unbucketed_cursor: 0,
        }
    }

    fn node_for_split(&mut self, split: &Split) -> WorkerNode {
        match split.bucket {
            Some(bucket) => match self.bucket_node_map.assigned_node(bucket) {
                Some(node) => node.clone(),
                // Dynamic map, assignment is bucket modulo node count so
                // every scheduler instance agrees on it.
                None => self.nodes[bucket as usize % self.nodes.len()].clone(),
            },
            None => {
                let node = self.nodes[self.unbucketed_cursor % self.nodes.len()].clone();
                self.unbucketed_cursor += 1;
                node
            }
        }
    }

    fn split_in_group(split: &Split, handle: ConnectorPartitionHandle) -> bool {
        match handle {
            ConnectorPartitionHandle::NotPartitioned => true,
            ConnectorPartitionHandle::Bucket(bucket) => split.bucket == Some(bucket),
        }
    }

    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.finished {
            return Ok(ScheduleResult::non_blocked(true, Vec::new(), 0));
        }

        let mut new_tasks: Vec<Arc<dyn RemoteTask>> = Vec::new();

        if !self.tasks_created {
            self.tasks_created = true;
            for (partition, node) in self.nodes.clone().iter().enumerate() {
                let task = self.stage.schedule_task(node, partition as u32)?;
                new_tasks.push(task);
            }
            // The task set is complete; consumers can learn all output
            // locations now even though splits are still flowing.
            self.stage.transition_to_scheduling_splits();
        }

        let mut fetch_futures: Vec<BoxFuture<'static, ()>> = Vec::new();
        for state in &mut self.sources {
            if state.exhausted || !state.pending.is_empty() {
                continue;
            }
            match state.split_source.fetch_next_batch(self.split_batch_size)? {
                SplitFetch::Ready(batch) => {
                    state.pending.extend(batch.splits);
                    state.exhausted = batch.no_more_splits || state.split_source.is_finished();
                }
                SplitFetch::Pending(fut) => fetch_futures.push(fut),
            }
        }

        let active: Vec<ConnectorPartitionHandle> = self
            .groups
            .iter()
            .filter(|g| !g.done)
            .take(self.max_active_groups)
            .map(|g| g.handle)
            .collect();

        let mut splits_scheduled = 0;
        let mut inactive_pending = false;
        for idx in 0..self.sources.len() {
            let pending = std::mem::take(&mut self.sources[idx].pending);
            let source = self.sources[idx].source;
            let mut later = Vec::new();
            for split in pending {
                if active.iter().any(|&h| Self::split_in_group(&split, h)) {
                    let node = self.node_for_split(&split);
                    let scheduled = self.stage.schedule_splits(&node, source, vec![split])?;
                    new_tasks.extend(scheduled.new_tasks);
                    splits_scheduled += scheduled.split_count;
                } else {
                    inactive_pending = true;
                    later.push(split);
                }
            }
            self.sources[idx].pending = later;
        }

        // A group is done when every source is exhausted and none of its
        // splits remain pending.
        if self.sources.iter().all(|s| s.exhausted) {
            for group in &mut self.groups {
                if group.done {
                    continue;
                }
                let has_pending = self
                    .sources
                    .iter()
                    .any(|s| s.pending.iter().any(|sp| Self::split_in_group(sp, group.handle)));
                if !has_pending {
                    group.done = true;
                }
            }
        }

        let all_sources_done =
            self.sources.iter().all(|s| s.exhausted && s.pending.is_empty());
        if all_sources_done && self.groups.iter().all(|g| g.done) {
            for state in &mut self.sources {
                self.stage.no_more_splits(state.source);
                state.split_source.close();
            }
            self.finished = true;
            return Ok(ScheduleResult::non_blocked(true, new_tasks, splits_scheduled));
        }

        let mut reason = None;
        if !fetch_futures.is_empty() {
            reason = Some(BlockedReason::WaitingForSource);
        }
        if inactive_pending {
            let r = BlockedReason::NoActiveExecutionGroup;
            reason = Some(reason.map_or(r, |prev: BlockedReason| prev.combine(r)));
        }

        match reason {
            Some(reason) => {
                let wait: BoxFuture<'static, ()> = if fetch_futures.is_empty() {
                    tokio::time::sleep(self.blocked_retry_wait).boxed()
                } else if fetch_futures.len() == 1 {
                    fetch_futures.remove(0)
                } else {
                    futures::future::select_all(fetch_futures).map(|_| ()).boxed()
                };
                Ok(ScheduleResult::blocked(new_tasks, splits_scheduled, wait, reason))
            }
            None => Ok(ScheduleResult::non_blocked(false, new_tasks, splits_scheduled)),
        }
    }

    pub fn close(&mut self) {
        for state in &mut self.sources {
            state.split_source.close();
        }
    }
}

impl std::fmt::Debug for FixedSourcePartitionedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSourcePartitionedScheduler")
            .field("stage_id", &self.stage.stage_id())
            .field("nodes", &self.nodes.len())
            .field("groups", &self.groups.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodePartitionMap;
    use crate::plan::{QueryId, StageId};
    use crate::testing::{MockRemoteTaskFactory, MockSplitSource, source_fragment, test_nodes};

    fn scheduler_for(
        node_count: usize,
        splits: Vec<Split>,
        handles: Vec<ConnectorPartitionHandle>,
    ) -> (FixedSourcePartitionedScheduler, Arc<StageExecution>, Arc<MockRemoteTaskFactory>) {
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let source = PlanNodeId(1);
        let stage = Arc::new(StageExecution::new(
            StageId::new(QueryId::new(), 0),
            source_fragment(0, source),
            factory.clone(),
        ));
        let nodes = test_nodes(node_count);
        let bucket_map = NodePartitionMap::new(
            nodes.clone(),
            (0..node_count as u32).collect(),
        )
        .unwrap()
        .as_bucket_node_map();
        let scheduler = FixedSourcePartitionedScheduler::new(
            stage.clone(),
            nodes,
            bucket_map,
            vec![(source, Box::new(MockSplitSource::with_splits(splits)) as Box<dyn SplitSource>)],
            handles,
            1,
            1000,
            Duration::from_millis(1),
        );
        (scheduler, stage, factory)
    }

    #[test]
    fn routes_buckets_to_their_nodes() {
        let splits = vec![
            Split::bucketed(0, 0),
            Split::bucketed(1, 1),
            Split::bucketed(2, 0),
            Split::bucketed(3, 1),
        ];
        let (mut scheduler, stage, factory) = scheduler_for(
            2,
            splits,
            vec![ConnectorPartitionHandle::NotPartitioned],
        );

        let result = scheduler.schedule().unwrap();
        assert!(result.is_finished());
        assert_eq!(2, result.new_tasks().len());
        assert_eq!(4, result.splits_scheduled());
        assert_eq!(crate::stage::StageState::SchedulingSplits, stage.state());

        let source = PlanNodeId(1);
        let tasks = factory.tasks();
        for task in &tasks {
            assert_eq!(2, task.splits_for(source).len());
            assert!(task.no_more_splits_for(source));
        }
        // Bucket 0 splits landed on node0, bucket 1 on node1.
        assert!(tasks[0].splits_for(source).iter().all(|s| s.bucket == Some(0)));
        assert!(tasks[1].splits_for(source).iter().all(|s| s.bucket == Some(1)));
    }

    #[tokio::test]
    async fn grouped_execution_bounds_active_groups() {
        let splits = vec![Split::bucketed(0, 0), Split::bucketed(1, 1)];
        let (mut scheduler, _stage, factory) = scheduler_for(
            1,
            splits,
            vec![
                ConnectorPartitionHandle::Bucket(0),
                ConnectorPartitionHandle::Bucket(1),
            ],
        );

        // One node and one group per node: only bucket 0 is active.
        let result = scheduler.schedule().unwrap();
        assert!(!result.is_finished());
        assert_eq!(
            Some(BlockedReason::NoActiveExecutionGroup),
            result.blocked_reason()
        );
        let source = PlanNodeId(1);
        assert_eq!(1, factory.tasks()[0].splits_for(source).len());

        // Bucket 0 drained, bucket 1 becomes active.
        let result = scheduler.schedule().unwrap();
        assert!(result.is_finished());
        assert_eq!(2, factory.tasks()[0].splits_for(source).len());
        assert!(factory.tasks()[0].no_more_splits_for(source));
    }

    #[test]
    fn pending_fetch_reports_waiting() {
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let source = PlanNodeId(1);
        let stage = Arc::new(StageExecution::new(
            StageId::new(QueryId::new(), 0),
            source_fragment(0, source),
            factory.clone(),
        ));
        let nodes = test_nodes(1);
        let mut scheduler = FixedSourcePartitionedScheduler::new(
            stage,
            nodes.clone(),
            NodePartitionMap::new(nodes, vec![0]).unwrap().as_bucket_node_map(),
            vec![(source, Box::new(MockSplitSource::pending()) as Box<dyn SplitSource>)],
            vec![ConnectorPartitionHandle::NotPartitioned],
            1,
            1000,
            Duration::from_millis(1),
        );

        let mut result = scheduler.schedule().unwrap();
        assert!(!result.is_finished());
        assert_eq!(Some(BlockedReason::WaitingForSource), result.blocked_reason());
        assert!(result.take_blocked().is_some());
        // The per-node tasks exist even while the source is still pending.
        assert_eq!(1, factory.tasks().len());
    }
}
