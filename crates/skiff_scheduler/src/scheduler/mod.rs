//! Distributed query scheduling.
//!
//! [`QueryScheduler`] owns the stage graph of one query and drives it from a
//! single scheduling loop. Each iteration asks the execution policy which
//! stages to work on, gives each one's strategy a tick, propagates newly
//! created tasks through the stage linkages, and then waits (bounded) on
//! whatever the strategies reported as blocking.

pub mod fixed_count;
pub mod fixed_source_partitioned;
pub mod graph;
pub mod linkage;
pub mod output_buffer;
pub mod policy;
pub mod result;
pub mod scaled_writer;
pub mod source_partitioned;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use skiff_error::{DbError, OptionExt, Result};
use tracing::{debug, error, warn};
use url::Url;

use crate::config::SchedulerConfig;
use crate::node::NodePlacement;
use crate::plan::{FragmentPlan, StageId};
use crate::query::{QueryState, QueryStateMachine};
use crate::stage::{
    BasicStageStats,
    StageExecution,
    StageInfo,
    StageState,
    aggregate_basic_stage_stats,
};
use crate::task::RemoteTaskFactory;

use self::fixed_count::FixedCountScheduler;
use self::fixed_source_partitioned::FixedSourcePartitionedScheduler;
use self::graph::{StageGraph, build_stage_graph};
use self::linkage::{ExchangeLocationsConsumer, StageLinkage};
use self::output_buffer::OutputBufferAssignment;
use self::policy::ExecutionPolicy;
use self::result::{BlockedReason, ScheduleResult};
use self::scaled_writer::ScaledWriterScheduler;
use self::source_partitioned::SourcePartitionedScheduler;

/// The scheduling strategy of one stage.
///
/// The strategy is determined by the fragment's partitioning at plan time
/// and never changes, so this is a closed set rather than a trait object.
#[derive(Debug)]
pub enum StageScheduler {
    SourcePartitioned(SourcePartitionedScheduler),
    FixedCount(FixedCountScheduler),
    FixedSourcePartitioned(FixedSourcePartitionedScheduler),
    ScaledWriter(ScaledWriterScheduler),
}

impl StageScheduler {
    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        match self {
            StageScheduler::SourcePartitioned(s) => s.schedule(),
            StageScheduler::FixedCount(s) => s.schedule(),
            StageScheduler::FixedSourcePartitioned(s) => s.schedule(),
            StageScheduler::ScaledWriter(s) => s.schedule(),
        }
    }

    /// Release connector resources. Idempotent.
    pub fn close(&mut self) {
        match self {
            StageScheduler::SourcePartitioned(s) => s.close(),
            StageScheduler::FixedSourcePartitioned(s) => s.close(),
            StageScheduler::FixedCount(_) | StageScheduler::ScaledWriter(_) => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    iterations: AtomicU64,
    splits_scheduled: AtomicU64,
    waiting_for_source: AtomicU64,
    split_queues_full: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub iterations: u64,
    pub splits_scheduled: u64,
    pub waiting_for_source: u64,
    pub split_queues_full: u64,
}

impl SchedulerStats {
    fn record(&self, result: &ScheduleResult) {
        self.splits_scheduled
            .fetch_add(result.splits_scheduled() as u64, Ordering::Relaxed);
        match result.blocked_reason() {
            Some(BlockedReason::WaitingForSource) => {
                self.waiting_for_source.fetch_add(1, Ordering::Relaxed);
            }
            Some(BlockedReason::SplitQueuesFull) => {
                self.split_queues_full.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            splits_scheduled: self.splits_scheduled.load(Ordering::Relaxed),
            waiting_for_source: self.waiting_for_source.load(Ordering::Relaxed),
            split_queues_full: self.split_queues_full.load(Ordering::Relaxed),
        }
    }
}

pub struct QueryScheduler {
    query: Arc<QueryStateMachine>,
    stages: Vec<Arc<StageExecution>>,
    stage_index: HashMap<StageId, usize>,
    /// Taken by the scheduling loop on its first run.
    schedulers: Mutex<Option<HashMap<StageId, StageScheduler>>>,
    linkages: HashMap<StageId, StageLinkage>,
    root_stage_id: StageId,
    policy: Mutex<Option<Box<dyn ExecutionPolicy>>>,
    config: SchedulerConfig,
    started: AtomicBool,
    stats: SchedulerStats,
}

impl QueryScheduler {
    pub fn new(
        query: Arc<QueryStateMachine>,
        plan: FragmentPlan,
        placement: &dyn NodePlacement,
        task_factory: Arc<dyn RemoteTaskFactory>,
        root_buffers: OutputBufferAssignment,
        policy: Box<dyn ExecutionPolicy>,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>> {
        if root_buffers.buffers.len() != 1 {
            return Err(DbError::new("Expected a single root output buffer")
                .with_field("buffers", root_buffers.buffers.len()));
        }
        let root_buffer_id = root_buffers.buffers[0].0;

        // Root task locations become the query's result locations; clients
        // read from the root tasks' single output buffer.
        let consumer_query = query.clone();
        let root_consumer: ExchangeLocationsConsumer = Arc::new(move |_, tasks, no_more| {
            let mut locations = Vec::with_capacity(tasks.len());
            for task in tasks {
                let base = task.status().location;
                let result_url = format!(
                    "{}/results/{}",
                    base.as_str().trim_end_matches('/'),
                    root_buffer_id.0
                );
                match Url::parse(&result_url) {
                    Ok(url) => locations.push(url),
                    Err(err) => {
                        warn!(%base, %err, "malformed task location");
                    }
                }
            }
            consumer_query.update_output_locations(locations, no_more);
        });

        let StageGraph {
            stages,
            schedulers,
            linkages,
        } = build_stage_graph(
            query.query_id(),
            plan,
            placement,
            task_factory,
            root_consumer,
            &config,
        )?;

        let root = stages.first().required("root stage")?;
        root.set_output_buffers(root_buffers);
        let root_stage_id = root.stage_id();

        let stage_index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.stage_id(), i))
            .collect();

        let scheduler = Arc::new(QueryScheduler {
            query,
            stages,
            stage_index,
            schedulers: Mutex::new(Some(schedulers)),
            linkages,
            root_stage_id,
            policy: Mutex::new(Some(policy)),
            config,
            started: AtomicBool::new(false),
            stats: SchedulerStats::default(),
        });
        QueryScheduler::initialize(&scheduler);
        Ok(scheduler)
    }

    /// Wire query state propagation. Subscriptions hold weak references so
    /// the scheduler can drop even with stages still alive.
    fn initialize(this: &Arc<QueryScheduler>) {
        let root = &this.stages[0];
        let query = this.query.clone();
        root.subscribe_state_changes(move |state| match state {
            StageState::Finished => query.transition_to_finishing(),
            StageState::Canceled => query.transition_to_canceled(),
            _ => {}
        });

        for stage in &this.stages {
            let query = this.query.clone();
            let weak_stage = Arc::downgrade(stage);
            let stage_id = stage.stage_id();
            stage.subscribe_state_changes(move |state| match state {
                StageState::Failed => {
                    let cause = weak_stage
                        .upgrade()
                        .and_then(|s| s.failure_cause())
                        .unwrap_or_else(|| {
                            DbError::new("Stage failed for an unknown reason")
                                .with_field("stage_id", stage_id)
                        });
                    query.transition_to_failed(cause);
                }
                StageState::Aborted => {
                    // An abort of a single stage without the query being done
                    // is a coordination bug, surfaced loudly.
                    query.transition_to_failed(
                        DbError::new("Query stage was aborted").with_field("stage_id", stage_id),
                    );
                }
                _ => {
                    // The query is running as soon as any stage has a task,
                    // even if no task has started executing yet.
                    if query.state() == QueryState::Starting
                        && weak_stage.upgrade().is_some_and(|s| s.has_tasks())
                    {
                        query.transition_to_running();
                    }
                }
            });

            let weak_self = Arc::downgrade(this);
            stage.subscribe_final_info(move |_| {
                if let Some(scheduler) = weak_self.upgrade() {
                    scheduler.query.set_stage_info(scheduler.stage_info());
                }
            });
        }
    }

    pub fn query(&self) -> &Arc<QueryStateMachine> {
        &self.query
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the scheduling loop. Subsequent calls are ignored.
    pub fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            if let Err(err) = self.run_schedule_loop().await {
                error!(query_id = %self.query.query_id(), %err, "query scheduling failed");
            }
        });
    }

    async fn run_schedule_loop(&self) -> Result<()> {
        let mut schedulers = self
            .schedulers
            .lock()
            .take()
            .required("scheduling loop already ran")?;
        let result = self.schedule_stages(&mut schedulers).await;
        for scheduler in schedulers.values_mut() {
            scheduler.close();
        }
        if let Err(err) = &result {
            self.query.transition_to_failed(err.clone());
        }
        result
    }

    async fn schedule_stages(
        &self,
        schedulers: &mut HashMap<StageId, StageScheduler>,
    ) -> Result<()> {
        let policy = self.policy.lock().take().required("execution policy")?;
        let mut schedule = policy.create_execution_schedule(self.stages.clone());
        let mut completed: HashSet<StageId> = HashSet::new();

        while !schedule.is_finished() {
            self.stats.iterations.fetch_add(1, Ordering::Relaxed);
            let mut blocked = Vec::new();

            for stage in schedule.stages_to_schedule() {
                let stage_id = stage.stage_id();
                stage.begin_scheduling();

                let scheduler = schedulers.get_mut(&stage_id).required("stage scheduler")?;
                let mut result = scheduler.schedule()?;

                if result.is_finished() {
                    stage.scheduling_complete();
                }
                // Linkage must see the post-tick state so the final no-more
                // flags go out together with the last tasks.
                if let Some(linkage) = self.linkages.get(&stage_id) {
                    linkage.process_schedule_results(stage.state(), result.new_tasks());
                }
                self.stats.record(&result);
                debug!(%stage_id, ?result, "scheduler tick");

                if let Some(fut) = result.take_blocked() {
                    blocked.push(fut);
                }
            }

            // Stages can complete outside the schedule path, through task
            // failures or cancellation. Flush their linkage exactly once so
            // parents still learn that no more tasks are coming.
            for stage in &self.stages {
                let stage_id = stage.stage_id();
                if !completed.contains(&stage_id) && stage.state().is_done() {
                    if let Some(linkage) = self.linkages.get(&stage_id) {
                        linkage.process_schedule_results(stage.state(), &[]);
                    }
                    completed.insert(stage_id);
                }
            }

            if !blocked.is_empty() {
                // Wait for any one of the blocked futures, but never longer
                // than the loop wait. Dropping the losers cancels them.
                let _ = tokio::time::timeout(
                    self.config.loop_wait,
                    futures::future::select_all(blocked),
                )
                .await;
            }
        }

        for stage in &self.stages {
            let state = stage.state();
            if !state.is_scheduling_done() {
                return Err(DbError::new("Scheduling is complete, but a stage is still scheduling")
                    .with_field("stage_id", stage.stage_id())
                    .with_field("state", state));
            }
        }
        Ok(())
    }

    /// Cancel a single stage. Used for partial-result queries where a
    /// consumer has read enough.
    pub fn cancel_stage(&self, stage_id: StageId) -> Result<()> {
        let index = self
            .stage_index
            .get(&stage_id)
            .ok_or_else(|| DbError::new("Unknown stage").with_field("stage_id", stage_id))?;
        self.stages[*index].cancel();
        Ok(())
    }

    /// Abort every stage, discarding all output.
    pub fn abort(&self) {
        for stage in &self.stages {
            stage.abort();
        }
    }

    pub fn stage_info(&self) -> StageInfo {
        self.build_stage_info(self.root_stage_id)
            .unwrap_or_else(|| StageInfo {
                stage_id: self.root_stage_id,
                state: StageState::Queued,
                tasks: Vec::new(),
                sub_stages: Vec::new(),
                failure_cause: None,
            })
    }

    fn build_stage_info(&self, stage_id: StageId) -> Option<StageInfo> {
        let index = *self.stage_index.get(&stage_id)?;
        let mut info = self.stages[index].stage_info_shallow();
        if let Some(linkage) = self.linkages.get(&stage_id) {
            info.sub_stages = linkage
                .child_stage_ids()
                .iter()
                .filter_map(|&child| self.build_stage_info(child))
                .collect();
        }
        Some(info)
    }

    pub fn basic_stage_stats(&self) -> BasicStageStats {
        aggregate_basic_stage_stats(self.stages.iter().map(|s| s.basic_stage_stats()))
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.stages.iter().map(|s| s.user_memory_reservation()).sum()
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.stages.iter().map(|s| s.total_memory_reservation()).sum()
    }

    pub fn total_cpu_time(&self) -> Duration {
        self.stages.iter().map(|s| s.total_cpu_time()).sum()
    }
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryScheduler")
            .field("query_id", &self.query.query_id())
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ExchangeKind, PlanFragmentId, PlanNodeId, QueryId, RemoteSourceNode};
    use crate::query::QueryState;
    use crate::scheduler::output_buffer::{OutputBufferId, OutputBufferKind};
    use crate::scheduler::policy::AllAtOncePolicy;
    use crate::split::SplitSource;
    use crate::task::RemoteTask;
    use crate::testing::{
        MockRemoteTaskFactory,
        MockSplitSource,
        StaticNodePlacement,
        fixed_fragment,
        fragment_plan,
        source_fragment,
        test_nodes,
    };

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            loop_wait: Duration::from_millis(10),
            blocked_retry_wait: Duration::from_millis(1),
            ..SchedulerConfig::default()
        }
    }

    fn two_stage_plan(split_count: usize) -> FragmentPlan {
        let scan = PlanNodeId(1);
        let child = fragment_plan(
            source_fragment(1, scan),
            vec![(
                scan,
                Box::new(MockSplitSource::with_split_count(split_count)) as Box<dyn SplitSource>,
            )],
            Vec::new(),
        );
        let root = fixed_fragment(
            0,
            vec![RemoteSourceNode {
                source_fragment: PlanFragmentId(1),
                exchange: ExchangeKind::Repartition,
            }],
        );
        fragment_plan(root, Vec::new(), vec![child])
    }

    fn root_buffers() -> OutputBufferAssignment {
        OutputBufferAssignment::single(OutputBufferKind::Broadcast, OutputBufferId(0))
    }

    fn build_scheduler(
        placement: &StaticNodePlacement,
        factory: Arc<MockRemoteTaskFactory>,
    ) -> Arc<QueryScheduler> {
        QueryScheduler::new(
            Arc::new(QueryStateMachine::new(QueryId::new())),
            two_stage_plan(4),
            placement,
            factory,
            root_buffers(),
            Box::new(AllAtOncePolicy),
            test_config(),
        )
        .unwrap()
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn schedules_two_stage_query_to_completion() {
        let placement = StaticNodePlacement::new(test_nodes(2));
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let scheduler = build_scheduler(&placement, factory.clone());
        let query = scheduler.query().clone();

        scheduler.clone().start();
        {
            let scheduler = scheduler.clone();
            wait_until("all stages scheduled", move || {
                scheduler.stage_info().state.is_scheduling_done()
                    && scheduler
                        .stage_info()
                        .sub_stages
                        .iter()
                        .all(|s| s.state.is_scheduling_done())
            })
            .await;
        }

        let root_tasks: Vec<_> = factory
            .tasks()
            .into_iter()
            .filter(|t| t.task_id().stage.index == 0)
            .collect();
        let child_tasks: Vec<_> = factory
            .tasks()
            .into_iter()
            .filter(|t| t.task_id().stage.index == 1)
            .collect();
        assert_eq!(2, root_tasks.len());
        assert!(!child_tasks.is_empty());
        assert!(root_tasks.iter().all(|t| t.is_started()));

        // Clients read from the single root output buffer of each root task.
        let (locations, no_more) = query.output_locations();
        assert!(no_more);
        let expected: Vec<Url> = root_tasks
            .iter()
            .map(|t| {
                Url::parse(&format!("{}/results/0", t.status().location.as_str()))
                    .unwrap()
            })
            .collect();
        assert_eq!(expected, locations);

        // Root tasks learned where to read the child's output from.
        wait_until("exchange locations delivered", || {
            root_tasks
                .iter()
                .all(|t| t.exchange_locations_for(PlanFragmentId(1)).1)
        })
        .await;
        let (child_locations, _) = root_tasks[0].exchange_locations_for(PlanFragmentId(1));
        assert_eq!(child_tasks.len(), child_locations.len());

        // Child tasks received their partitioned output buffer layout.
        for task in &child_tasks {
            let assignment = task.buffer_assignment().unwrap();
            assert_eq!(OutputBufferKind::Partitioned, assignment.kind);
            assert!(assignment.no_more_buffers);
        }

        let stats = scheduler.stats();
        assert!(stats.iterations >= 1);
        assert_eq!(4, stats.splits_scheduled);
    }

    #[tokio::test]
    async fn query_runs_once_any_stage_has_tasks() {
        let placement = StaticNodePlacement::new(test_nodes(1));
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let scheduler = build_scheduler(&placement, factory.clone());
        let query = scheduler.query().clone();
        assert_eq!(QueryState::Starting, query.state());

        scheduler.start();
        // Mock tasks never report a running state; a stage having tasks at
        // all moves the query out of Starting.
        wait_until("query running", || query.state() == QueryState::Running).await;
        assert!(!factory.tasks().is_empty());
    }

    #[test]
    fn aborted_stage_is_a_query_failure() {
        let placement = StaticNodePlacement::new(test_nodes(1));
        let scheduler = build_scheduler(&placement, Arc::new(MockRemoteTaskFactory::new()));
        let query = scheduler.query().clone();

        scheduler.stages[1].abort();
        assert_eq!(QueryState::Failed, query.state());
        let cause = query.failure_cause().unwrap();
        assert!(cause.message().contains("Query stage was aborted"));
    }

    #[tokio::test]
    async fn task_creation_failure_fails_the_query() {
        let placement = StaticNodePlacement::new(test_nodes(1));
        let factory = Arc::new(MockRemoteTaskFactory::new());
        factory.fail_next_create();
        let scheduler = build_scheduler(&placement, factory);
        let query = scheduler.query().clone();

        scheduler.start();
        wait_until("query failure", || query.state() == QueryState::Failed).await;
        let cause = query.failure_cause().unwrap();
        assert!(cause.message().contains("Task creation failed"));
    }

    #[test]
    fn canceling_the_root_stage_cancels_the_query() {
        let placement = StaticNodePlacement::new(test_nodes(1));
        let scheduler = build_scheduler(&placement, Arc::new(MockRemoteTaskFactory::new()));
        let query = scheduler.query().clone();

        let unknown = StageId::new(QueryId::new(), 7);
        assert!(scheduler.cancel_stage(unknown).is_err());

        scheduler
            .cancel_stage(StageId::new(query.query_id(), 0))
            .unwrap();
        assert_eq!(QueryState::Canceled, query.state());
    }

    #[test]
    fn rejects_multiple_root_buffers() {
        let placement = StaticNodePlacement::new(test_nodes(1));
        let buffers = OutputBufferAssignment {
            kind: OutputBufferKind::Broadcast,
            buffers: vec![(OutputBufferId(0), 0), (OutputBufferId(1), 1)],
            no_more_buffers: true,
            version: 0,
        };
        let result = QueryScheduler::new(
            Arc::new(QueryStateMachine::new(QueryId::new())),
            two_stage_plan(1),
            &placement,
            Arc::new(MockRemoteTaskFactory::new()),
            buffers,
            Box::new(AllAtOncePolicy),
            test_config(),
        );
        assert!(result.is_err());
    }
}
