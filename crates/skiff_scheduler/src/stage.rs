//! Stage execution state.
//!
//! A [`StageExecution`] owns the tasks of one plan fragment and tracks the
//! stage through its lifecycle. State transitions are serialized under a
//! single mutex; subscriber callbacks always fire after the lock is
//! released so subscribers may call back into the stage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use skiff_error::{DbError, Result};
use tracing::debug;
use url::Url;

use crate::node::WorkerNode;
use crate::plan::{PlanFragment, PlanFragmentId, PlanNodeId, StageId};
use crate::scheduler::output_buffer::OutputBufferAssignment;
use crate::split::Split;
use crate::task::{RemoteTask, RemoteTaskFactory, TaskId, TaskState, TaskStatus};
use crate::util::Subscribers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    /// No tasks created yet.
    Queued,
    /// The stage's scheduler is creating tasks and assigning splits.
    Scheduling,
    /// All tasks exist, splits are still being assigned.
    SchedulingSplits,
    /// Scheduling is complete but no task has started producing output.
    Scheduled,
    Running,
    /// All tasks are draining their output buffers.
    Flushing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl StageState {
    pub const fn is_done(&self) -> bool {
        matches!(
            self,
            StageState::Finished
                | StageState::Canceled
                | StageState::Aborted
                | StageState::Failed
        )
    }

    /// New tasks may only be created before split scheduling starts. Once a
    /// stage reaches SchedulingSplits its task set is frozen, which is what
    /// lets consumers learn the complete set of output locations.
    pub const fn can_schedule_more_tasks(&self) -> bool {
        matches!(self, StageState::Queued | StageState::Scheduling)
    }

    pub const fn is_scheduling_done(&self) -> bool {
        matches!(
            self,
            StageState::Scheduled | StageState::Running | StageState::Flushing
        ) || self.is_done()
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Queued => "QUEUED",
            StageState::Scheduling => "SCHEDULING",
            StageState::SchedulingSplits => "SCHEDULING_SPLITS",
            StageState::Scheduled => "SCHEDULED",
            StageState::Running => "RUNNING",
            StageState::Flushing => "FLUSHING",
            StageState::Finished => "FINISHED",
            StageState::Canceled => "CANCELED",
            StageState::Aborted => "ABORTED",
            StageState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of a stage and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub state: StageState,
    pub tasks: Vec<TaskStatus>,
    pub sub_stages: Vec<StageInfo>,
    pub failure_cause: Option<String>,
}

/// Low-overhead stats suitable for frequent polling.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BasicStageStats {
    pub is_scheduled: bool,
    pub total_tasks: usize,
    pub running_tasks: usize,
    pub queued_splits: usize,
    pub running_splits: usize,
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub user_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub cpu_time: Duration,
}

/// Sum per-stage stats into a query-level rollup.
pub fn aggregate_basic_stage_stats<I>(stats: I) -> BasicStageStats
where
    I: IntoIterator<Item = BasicStageStats>,
{
    let mut agg = BasicStageStats {
        is_scheduled: true,
        ..BasicStageStats::default()
    };
    for s in stats {
        agg.is_scheduled &= s.is_scheduled;
        agg.total_tasks += s.total_tasks;
        agg.running_tasks += s.running_tasks;
        agg.queued_splits += s.queued_splits;
        agg.running_splits += s.running_splits;
        agg.rows_processed += s.rows_processed;
        agg.bytes_processed += s.bytes_processed;
        agg.user_memory_bytes += s.user_memory_bytes;
        agg.total_memory_bytes += s.total_memory_bytes;
        agg.cpu_time += s.cpu_time;
    }
    agg
}

/// Tasks newly created while scheduling splits, plus how many splits were
/// assigned.
#[derive(Debug)]
pub struct ScheduledSplits {
    pub new_tasks: Vec<Arc<dyn RemoteTask>>,
    pub split_count: usize,
}

struct StageInner {
    state: StageState,
    tasks: Vec<Arc<dyn RemoteTask>>,
    tasks_by_node: HashMap<String, usize>,
    next_task_id: u32,
    output_buffers: Option<OutputBufferAssignment>,
    /// Exchange locations per source fragment, with a flag marking the set
    /// complete.
    exchange_locations: HashMap<PlanFragmentId, (Vec<Url>, bool)>,
    failure_cause: Option<DbError>,
}

pub struct StageExecution {
    stage_id: StageId,
    fragment: PlanFragment,
    task_factory: Arc<dyn RemoteTaskFactory>,
    inner: Mutex<StageInner>,
    state_subscribers: Subscribers<StageState>,
    final_info_subscribers: Subscribers<StageInfo>,
    final_info_published: AtomicBool,
}

impl StageExecution {
    pub fn new(
        stage_id: StageId,
        fragment: PlanFragment,
        task_factory: Arc<dyn RemoteTaskFactory>,
    ) -> Self {
        StageExecution {
            stage_id,
            fragment,
            task_factory,
            inner: Mutex::new(StageInner {
                state: StageState::Queued,
                tasks: Vec::new(),
                tasks_by_node: HashMap::new(),
                next_task_id: 0,
                output_buffers: None,
                exchange_locations: HashMap::new(),
                failure_cause: None,
            }),
            state_subscribers: Subscribers::new(),
            final_info_subscribers: Subscribers::new(),
            final_info_published: AtomicBool::new(false),
        }
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn fragment(&self) -> &PlanFragment {
        &self.fragment
    }

    pub fn state(&self) -> StageState {
        self.inner.lock().state
    }

    pub fn has_tasks(&self) -> bool {
        !self.inner.lock().tasks.is_empty()
    }

    pub fn all_tasks(&self) -> Vec<Arc<dyn RemoteTask>> {
        self.inner.lock().tasks.clone()
    }

    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        self.all_tasks().iter().map(|t| t.status()).collect()
    }

    /// True when any task reports a full output buffer, meaning downstream
    /// consumers are not keeping up.
    pub fn is_any_task_blocked(&self) -> bool {
        self.all_tasks().iter().any(|t| t.status().output_buffer_full)
    }

    pub fn failure_cause(&self) -> Option<DbError> {
        self.inner.lock().failure_cause.clone()
    }

    /// Register a callback for every state change. Fired outside the stage
    /// lock.
    pub fn subscribe_state_changes<F>(&self, f: F)
    where
        F: Fn(StageState) + Send + Sync + 'static,
    {
        self.state_subscribers.subscribe(f);
    }

    /// Register a callback for the final stage info, delivered exactly once
    /// when the stage reaches a terminal state.
    pub fn subscribe_final_info<F>(&self, f: F)
    where
        F: Fn(StageInfo) + Send + Sync + 'static,
    {
        self.final_info_subscribers.subscribe(f);
    }

    fn publish_state(&self, state: StageState) {
        debug!(stage_id = %self.stage_id, %state, "stage state change");
        self.state_subscribers.notify(state);
        if state.is_done() && !self.final_info_published.swap(true, Ordering::SeqCst) {
            self.final_info_subscribers.notify(self.stage_info_shallow());
        }
    }

    /// Snapshot without sub-stages; the scheduler stitches the tree together
    /// since only it knows the stage topology.
    pub fn stage_info_shallow(&self) -> StageInfo {
        let (state, cause) = {
            let inner = self.inner.lock();
            (inner.state, inner.failure_cause.clone())
        };
        StageInfo {
            stage_id: self.stage_id,
            state,
            tasks: self.task_statuses(),
            sub_stages: Vec::new(),
            failure_cause: cause.map(|e| e.to_string()),
        }
    }

    pub fn basic_stage_stats(&self) -> BasicStageStats {
        let state = self.state();
        let mut stats = BasicStageStats {
            is_scheduled: state.is_scheduling_done(),
            ..BasicStageStats::default()
        };
        for status in self.task_statuses() {
            stats.total_tasks += 1;
            if status.state == TaskState::Running {
                stats.running_tasks += 1;
            }
            stats.queued_splits += status.queued_splits;
            stats.running_splits += status.running_splits;
            stats.rows_processed += status.rows_processed;
            stats.bytes_processed += status.bytes_processed;
            stats.user_memory_bytes += status.user_memory_bytes;
            stats.total_memory_bytes += status.total_memory_bytes;
            stats.cpu_time += status.cpu_time;
        }
        stats
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.task_statuses().iter().map(|s| s.user_memory_bytes).sum()
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.task_statuses().iter().map(|s| s.total_memory_bytes).sum()
    }

    pub fn total_cpu_time(&self) -> Duration {
        self.task_statuses().iter().map(|s| s.cpu_time).sum()
    }

    /// Move Queued -> Scheduling. No-op in any other state.
    pub fn begin_scheduling(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.state == StageState::Queued {
                inner.state = StageState::Scheduling;
                Some(inner.state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }

    /// Freeze the task set while splits are still being assigned.
    pub fn transition_to_scheduling_splits(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, StageState::Queued | StageState::Scheduling) {
                inner.state = StageState::SchedulingSplits;
                Some(inner.state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }

    /// Mark scheduling finished. Re-evaluates task completion immediately in
    /// case all tasks already finished while splits were being assigned.
    pub fn scheduling_complete(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                StageState::Queued | StageState::Scheduling | StageState::SchedulingSplits
            ) {
                inner.state = StageState::Scheduled;
                Some(inner.state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            self.publish_state(state);
        }
        self.on_task_status_change();
    }

    /// Create a new task on `node` with no initial splits.
    pub fn schedule_task(
        &self,
        node: &WorkerNode,
        partition: u32,
    ) -> Result<Arc<dyn RemoteTask>> {
        self.create_task(node, partition, HashMap::new())
    }

    /// Assign `splits` from `source` to a task on `node`, creating the task
    /// if the node has none yet.
    pub fn schedule_splits(
        &self,
        node: &WorkerNode,
        source: PlanNodeId,
        splits: Vec<Split>,
    ) -> Result<ScheduledSplits> {
        let split_count = splits.len();
        let existing = {
            let inner = self.inner.lock();
            inner.tasks_by_node.get(&node.id).map(|&idx| inner.tasks[idx].clone())
        };
        match existing {
            Some(task) => {
                task.add_splits(source, splits);
                Ok(ScheduledSplits {
                    new_tasks: Vec::new(),
                    split_count,
                })
            }
            None => {
                let mut initial = HashMap::new();
                initial.insert(source, splits);
                let task = self.create_task(node, 0, initial)?;
                Ok(ScheduledSplits {
                    new_tasks: vec![task],
                    split_count,
                })
            }
        }
    }

    fn create_task(
        &self,
        node: &WorkerNode,
        _partition: u32,
        initial_splits: HashMap<PlanNodeId, Vec<Split>>,
    ) -> Result<Arc<dyn RemoteTask>> {
        let (task_id, buffers) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return Err(DbError::new("Cannot schedule new tasks on a completed stage")
                    .with_field("stage_id", self.stage_id)
                    .with_field("state", inner.state));
            }
            let task_id = TaskId {
                stage: self.stage_id,
                id: inner.next_task_id,
            };
            inner.next_task_id += 1;
            (task_id, inner.output_buffers.clone())
        };

        let task = self.task_factory.create_task(node, task_id, initial_splits)?;

        let replay = {
            let mut inner = self.inner.lock();
            let index = inner.tasks.len();
            inner.tasks_by_node.insert(node.id.clone(), index);
            inner.tasks.push(task.clone());
            inner
                .exchange_locations
                .iter()
                .map(|(&fragment, (locations, no_more))| (fragment, locations.clone(), *no_more))
                .collect::<Vec<_>>()
        };
        // Replay exchange locations learned before this task existed.
        for (fragment, locations, no_more) in replay {
            task.add_exchange_locations(fragment, locations, no_more);
        }
        if let Some(buffers) = buffers {
            task.set_output_buffers(buffers);
        }
        task.start();
        Ok(task)
    }

    /// Broadcast end-of-splits for a source to every task.
    pub fn no_more_splits(&self, source: PlanNodeId) {
        for task in self.all_tasks() {
            task.no_more_splits(source);
        }
    }

    /// Record and forward a new output buffer assignment to all tasks.
    pub fn set_output_buffers(&self, buffers: OutputBufferAssignment) {
        let tasks = {
            let mut inner = self.inner.lock();
            inner.output_buffers = Some(buffers.clone());
            inner.tasks.clone()
        };
        for task in tasks {
            task.set_output_buffers(buffers.clone());
        }
    }

    /// Record exchange locations produced by a child stage and forward them
    /// to every existing task.
    pub fn add_exchange_locations(
        &self,
        fragment: PlanFragmentId,
        locations: Vec<Url>,
        no_more: bool,
    ) {
        let tasks = {
            let mut inner = self.inner.lock();
            let entry = inner
                .exchange_locations
                .entry(fragment)
                .or_insert_with(|| (Vec::new(), false));
            entry.0.extend(locations.iter().cloned());
            entry.1 |= no_more;
            inner.tasks.clone()
        };
        for task in tasks {
            task.add_exchange_locations(fragment, locations.clone(), no_more);
        }
    }

    pub fn exchange_locations(&self, fragment: PlanFragmentId) -> (Vec<Url>, bool) {
        self.inner
            .lock()
            .exchange_locations
            .get(&fragment)
            .cloned()
            .unwrap_or((Vec::new(), false))
    }

    /// Stop the stage, keeping produced output available.
    pub fn cancel(&self) {
        let (changed, tasks) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                (None, Vec::new())
            } else {
                inner.state = StageState::Canceled;
                (Some(inner.state), inner.tasks.clone())
            }
        };
        for task in tasks {
            task.cancel();
        }
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }

    /// Stop the stage and discard its output.
    pub fn abort(&self) {
        let (changed, tasks) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                (None, Vec::new())
            } else {
                inner.state = StageState::Aborted;
                (Some(inner.state), inner.tasks.clone())
            }
        };
        for task in tasks {
            task.abort();
        }
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }

    /// Fail the stage. The first failure cause wins; later failures are
    /// dropped since the query is already doomed by the first.
    pub fn fail(&self, cause: DbError) {
        let (changed, tasks) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                (None, Vec::new())
            } else {
                if inner.failure_cause.is_none() {
                    inner.failure_cause = Some(cause);
                }
                inner.state = StageState::Failed;
                (Some(inner.state), inner.tasks.clone())
            }
        };
        for task in tasks {
            task.abort();
        }
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }

    /// Derive the stage state from current task states. Call whenever a
    /// task status changes.
    pub fn on_task_status_change(&self) {
        let statuses = self.task_statuses();

        for status in &statuses {
            if status.state == TaskState::Failed {
                let message = status
                    .failure
                    .clone()
                    .unwrap_or_else(|| "Task failed for an unknown reason".to_string());
                self.fail(
                    DbError::new(message).with_field("task_id", status.task_id),
                );
                return;
            }
        }

        let changed = {
            let mut inner = self.inner.lock();
            // Completion is only derived once scheduling has finished; before
            // that an empty or momentarily finished task set means nothing.
            if inner.state.is_done() || !inner.state.is_scheduling_done() {
                None
            } else if !statuses.is_empty() && statuses.iter().all(|s| s.state.is_done()) {
                if statuses.iter().all(|s| s.state == TaskState::Finished) {
                    inner.state = StageState::Finished;
                    Some(inner.state)
                } else {
                    inner.failure_cause.get_or_insert_with(|| {
                        DbError::new("A task did not finish cleanly")
                            .with_field("stage_id", self.stage_id)
                    });
                    inner.state = StageState::Failed;
                    Some(inner.state)
                }
            } else if !statuses.is_empty()
                && statuses
                    .iter()
                    .all(|s| s.state == TaskState::Flushing || s.state.is_done())
            {
                if inner.state != StageState::Flushing {
                    inner.state = StageState::Flushing;
                    Some(inner.state)
                } else {
                    None
                }
            } else if inner.state == StageState::Scheduled
                && statuses.iter().any(|s| s.state == TaskState::Running)
            {
                inner.state = StageState::Running;
                Some(inner.state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            self.publish_state(state);
        }
    }
}

impl fmt::Debug for StageExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecution")
            .field("stage_id", &self.stage_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::plan::{PlanFragmentId, QueryId};
    use crate::scheduler::output_buffer::{OutputBufferAssignment, OutputBufferId, OutputBufferKind};
    use crate::testing::{MockRemoteTaskFactory, source_fragment, test_nodes};

    fn test_stage() -> (Arc<StageExecution>, Arc<MockRemoteTaskFactory>) {
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let stage = Arc::new(StageExecution::new(
            StageId::new(QueryId::new(), 0),
            source_fragment(0, PlanNodeId(1)),
            factory.clone(),
        ));
        (stage, factory)
    }

    #[test]
    fn task_ids_are_sequential() {
        let (stage, factory) = test_stage();
        let nodes = test_nodes(2);
        stage.schedule_task(&nodes[0], 0).unwrap();
        stage.schedule_task(&nodes[1], 1).unwrap();
        let tasks = factory.tasks();
        assert_eq!(vec![0, 1], tasks.iter().map(|t| t.task_id().id).collect::<Vec<_>>());
        assert!(tasks.iter().all(|t| t.is_started()));
    }

    #[test]
    fn stage_info_serializes_to_json() {
        let (stage, _factory) = test_stage();
        stage.begin_scheduling();
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        let info = serde_json::to_value(stage.stage_info_shallow()).unwrap();
        assert_eq!("Scheduling", info["state"]);
        assert_eq!(1, info["tasks"].as_array().unwrap().len());
        assert!(info["failure_cause"].is_null());
    }

    #[test]
    fn splits_reuse_the_node_task() {
        let (stage, factory) = test_stage();
        let nodes = test_nodes(2);
        let source = PlanNodeId(1);
        stage.schedule_splits(&nodes[0], source, vec![Split::new(0)]).unwrap();
        let again = stage
            .schedule_splits(&nodes[0], source, vec![Split::new(1)])
            .unwrap();
        assert!(again.new_tasks.is_empty());
        let other = stage
            .schedule_splits(&nodes[1], source, vec![Split::new(2)])
            .unwrap();
        assert_eq!(1, other.new_tasks.len());

        let tasks = factory.tasks();
        assert_eq!(2, tasks.len());
        assert_eq!(2, tasks[0].splits_for(source).len());
        assert_eq!(1, tasks[1].splits_for(source).len());
    }

    #[test]
    fn completed_stage_rejects_new_tasks() {
        let (stage, _factory) = test_stage();
        stage.cancel();
        assert_eq!(StageState::Canceled, stage.state());
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap_err();
    }

    #[test]
    fn failed_task_fails_the_stage() {
        let (stage, factory) = test_stage();
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        stage.scheduling_complete();

        factory.tasks()[0].set_failure("worker exploded");
        stage.on_task_status_change();

        assert_eq!(StageState::Failed, stage.state());
        let cause = stage.failure_cause().unwrap();
        assert!(cause.message().contains("worker exploded"));
    }

    #[test]
    fn stage_finishes_when_all_tasks_finish() {
        let (stage, factory) = test_stage();
        let nodes = test_nodes(2);
        stage.schedule_task(&nodes[0], 0).unwrap();
        stage.schedule_task(&nodes[1], 1).unwrap();
        stage.scheduling_complete();
        assert_eq!(StageState::Scheduled, stage.state());

        let tasks = factory.tasks();
        tasks[0].set_state(TaskState::Running);
        stage.on_task_status_change();
        assert_eq!(StageState::Running, stage.state());

        for task in &tasks {
            task.set_state(TaskState::Flushing);
        }
        stage.on_task_status_change();
        assert_eq!(StageState::Flushing, stage.state());

        for task in &tasks {
            task.set_state(TaskState::Finished);
        }
        stage.on_task_status_change();
        assert_eq!(StageState::Finished, stage.state());
    }

    #[test]
    fn final_info_is_published_once() {
        let (stage, factory) = test_stage();
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        stage.scheduling_complete();

        let published = Arc::new(AtomicUsize::new(0));
        let count = published.clone();
        stage.subscribe_final_info(move |info| {
            assert_eq!(StageState::Finished, info.state);
            count.fetch_add(1, Ordering::SeqCst);
        });

        factory.tasks()[0].set_state(TaskState::Finished);
        stage.on_task_status_change();
        stage.on_task_status_change();
        stage.cancel();
        assert_eq!(1, published.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_stops_tasks() {
        let (stage, factory) = test_stage();
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        stage.cancel();
        assert_eq!(TaskState::Canceled, factory.tasks()[0].status().state);
    }

    #[test]
    fn exchange_locations_replay_to_new_tasks() {
        let (stage, factory) = test_stage();
        let nodes = test_nodes(2);
        let fragment = PlanFragmentId(7);
        let location = url::Url::parse("http://node0:8080/v1/task/t0").unwrap();

        stage.schedule_task(&nodes[0], 0).unwrap();
        stage.add_exchange_locations(fragment, vec![location.clone()], true);
        stage.schedule_task(&nodes[1], 1).unwrap();

        for task in factory.tasks() {
            let (locations, no_more) = task.exchange_locations_for(fragment);
            assert_eq!(vec![location.clone()], locations);
            assert!(no_more);
        }
    }

    #[test]
    fn output_buffers_reach_all_tasks() {
        let (stage, factory) = test_stage();
        let nodes = test_nodes(2);
        stage.schedule_task(&nodes[0], 0).unwrap();

        let assignment =
            OutputBufferAssignment::single(OutputBufferKind::Partitioned, OutputBufferId(0));
        stage.set_output_buffers(assignment.clone());
        stage.schedule_task(&nodes[1], 1).unwrap();

        for task in factory.tasks() {
            let got = task.buffer_assignment().unwrap();
            assert_eq!(OutputBufferKind::Partitioned, got.kind);
            assert_eq!(assignment.buffers, got.buffers);
        }
    }
}
