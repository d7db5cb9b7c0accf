//! Stage graph construction.
//!
//! The graph is built in two passes over the fragment tree. The first pass
//! allocates stages into an arena indexed by stage id and picks a scheduling
//! strategy per stage; a parent always receives a lower index than its
//! descendants. The second pass wires cross-stage plumbing by id: exchange
//! location consumers, child output buffer managers, cascading cancellation
//! and writer completion flags.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use skiff_error::{DbError, ErrorCode, OptionExt, Result};

use crate::config::SchedulerConfig;
use crate::node::{
    ConnectorPartitionHandle,
    DynamicSplitPlacement,
    NodePartitionMap,
    NodePlacement,
};
use crate::plan::{
    ExchangeKind,
    FragmentPlan,
    PartitioningHandle,
    QueryId,
    StageId,
};
use crate::scheduler::StageScheduler;
use crate::scheduler::fixed_count::FixedCountScheduler;
use crate::scheduler::fixed_source_partitioned::FixedSourcePartitionedScheduler;
use crate::scheduler::linkage::{ExchangeLocationsConsumer, StageLinkage};
use crate::scheduler::output_buffer::OutputBufferManager;
use crate::scheduler::scaled_writer::ScaledWriterScheduler;
use crate::scheduler::source_partitioned::SourcePartitionedScheduler;
use crate::stage::{StageExecution, StageState};
use crate::task::RemoteTaskFactory;

#[derive(Debug)]
pub struct StageGraph {
    pub stages: Vec<Arc<StageExecution>>,
    pub schedulers: HashMap<StageId, StageScheduler>,
    pub linkages: HashMap<StageId, StageLinkage>,
}

struct BuiltStage {
    stage: Arc<StageExecution>,
    scheduler: StageScheduler,
    children: Vec<usize>,
    /// Set for scaled writer stages; flipped once every child completes.
    writer_finish: Option<Arc<AtomicBool>>,
}

struct GraphBuilder<'a> {
    query_id: QueryId,
    placement: &'a dyn NodePlacement,
    task_factory: Arc<dyn RemoteTaskFactory>,
    config: &'a SchedulerConfig,
    built: Vec<Option<BuiltStage>>,
    /// Node partition maps are resolved once per handle so sibling stages
    /// sharing a distribution agree on node assignment.
    partition_maps: HashMap<PartitioningHandle, NodePartitionMap>,
}

pub fn build_stage_graph(
    query_id: QueryId,
    plan: FragmentPlan,
    placement: &dyn NodePlacement,
    task_factory: Arc<dyn RemoteTaskFactory>,
    root_locations_consumer: ExchangeLocationsConsumer,
    config: &SchedulerConfig,
) -> Result<StageGraph> {
    let mut builder = GraphBuilder {
        query_id,
        placement,
        task_factory,
        config,
        built: Vec::new(),
        partition_maps: HashMap::new(),
    };
    // The root stage has a single consumer, the client.
    builder.build(plan.with_bucket_to_partition(Some(vec![0])))?;

    let mut built: Vec<BuiltStage> = Vec::with_capacity(builder.built.len());
    for entry in builder.built {
        built.push(entry.required("built stage")?);
    }

    // Pass 2: wire everything that crosses stage boundaries.
    let mut parent_of: HashMap<usize, usize> = HashMap::new();
    for (index, entry) in built.iter().enumerate() {
        for &child in &entry.children {
            parent_of.insert(child, index);
        }
    }

    let mut linkages = HashMap::new();
    for (index, entry) in built.iter().enumerate() {
        let stage = &entry.stage;
        let child_stages: Vec<Arc<StageExecution>> = entry
            .children
            .iter()
            .map(|&c| built[c].stage.clone())
            .collect();

        // Once a stage is flushing or done it consumes no more input, so its
        // children can stop producing.
        if !child_stages.is_empty() {
            let cancel_targets = child_stages.clone();
            stage.subscribe_state_changes(move |state| {
                if state == StageState::Flushing || state.is_done() {
                    for child in &cancel_targets {
                        child.cancel();
                    }
                }
            });
        }

        if let Some(finish) = &entry.writer_finish {
            let finish = finish.clone();
            when_all_stages(&child_stages, move || {
                finish.store(true, Ordering::SeqCst);
            });
        }

        let parent: ExchangeLocationsConsumer = match parent_of.get(&index) {
            Some(&p) => {
                let parent_stage = built[p].stage.clone();
                Arc::new(move |fragment, tasks, no_more| {
                    let locations = tasks.iter().map(|t| t.status().location).collect();
                    parent_stage.add_exchange_locations(fragment, locations, no_more);
                })
            }
            None => root_locations_consumer.clone(),
        };

        let mut managers = Vec::with_capacity(child_stages.len());
        for child in &child_stages {
            managers.push(buffer_manager_for(child.clone())?);
        }

        linkages.insert(
            stage.stage_id(),
            StageLinkage::new(
                stage.fragment().id,
                parent,
                managers,
                child_stages.iter().map(|c| c.stage_id()).collect(),
            ),
        );
    }

    let mut stages = Vec::with_capacity(built.len());
    let mut schedulers = HashMap::new();
    for entry in built {
        schedulers.insert(entry.stage.stage_id(), entry.scheduler);
        stages.push(entry.stage);
    }

    Ok(StageGraph {
        stages,
        schedulers,
        linkages,
    })
}

/// Pick the output buffer strategy for a child stage from its output
/// partitioning.
fn buffer_manager_for(child: Arc<StageExecution>) -> Result<OutputBufferManager> {
    match child.fragment().output_partitioning {
        PartitioningHandle::Broadcast => Ok(OutputBufferManager::broadcast(child)),
        PartitioningHandle::ScaledWriter => Ok(OutputBufferManager::scaled(child)),
        _ => {
            let partition_count = child
                .fragment()
                .bucket_to_partition
                .as_ref()
                .and_then(|map| map.iter().max().copied())
                .map(|max| max + 1)
                .ok_or_else(|| {
                    DbError::new("Partitioned output requires a bucket to partition mapping")
                        .with_field("stage_id", child.stage_id())
                })?;
            Ok(OutputBufferManager::partitioned(child, partition_count))
        }
    }
}

/// Invoke `on_complete` exactly once, when every listed stage has reached a
/// terminal state. Fires immediately for an empty list.
pub fn when_all_stages<F>(stages: &[Arc<StageExecution>], on_complete: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let pending: HashSet<StageId> = stages.iter().map(|s| s.stage_id()).collect();
    if pending.is_empty() {
        on_complete();
        return;
    }
    let pending = Arc::new(Mutex::new(pending));
    let on_complete = Arc::new(on_complete);

    for stage in stages {
        let id = stage.stage_id();
        let pending = pending.clone();
        let callback = on_complete.clone();
        stage.subscribe_state_changes(move |state| {
            if state.is_done() {
                let fire = {
                    let mut pending = pending.lock();
                    pending.remove(&id) && pending.is_empty()
                };
                if fire {
                    callback();
                }
            }
        });
    }
    // A stage may already have completed before its subscription landed.
    for stage in stages {
        if stage.state().is_done() {
            let fire = {
                let mut guard = pending.lock();
                guard.remove(&stage.stage_id()) && guard.is_empty()
            };
            if fire {
                on_complete();
            }
        }
    }
}

impl GraphBuilder<'_> {
    fn build(&mut self, plan: FragmentPlan) -> Result<usize> {
        let index = self.built.len();
        self.built.push(None);

        let FragmentPlan {
            fragment,
            mut split_sources,
            children,
        } = plan;
        let stage_id = StageId::new(self.query_id, index);
        let stage = Arc::new(StageExecution::new(
            stage_id,
            fragment.clone(),
            self.task_factory.clone(),
        ));

        let built = match &fragment.partitioning {
            PartitioningHandle::Source => {
                if fragment.execution.grouped_execution {
                    return Err(DbError::new(
                        "Dynamic split placement cannot be combined with grouped execution",
                    )
                    .with_field("fragment", fragment.id));
                }
                if fragment.partitioned_sources.len() != 1 {
                    return Err(DbError::new(
                        "Expected exactly one split source for a source-distributed stage",
                    )
                    .with_field("fragment", fragment.id)
                    .with_field("sources", fragment.partitioned_sources.len()));
                }
                let source_node = fragment.partitioned_sources[0];
                let split_source = split_sources
                    .remove(&source_node)
                    .required("split source for scan node")?;

                let child_stages = self.build_children(children, Some(vec![0]))?;

                let catalog = split_source.catalog().map(|c| c.to_string());
                let selector = self.placement.create_node_selector(catalog.as_deref());
                let status_stage = stage.clone();
                let placement = DynamicSplitPlacement::new(
                    selector,
                    Arc::new(move || status_stage.task_statuses()),
                    self.config.max_splits_per_node,
                    self.config.max_pending_splits_per_task,
                );
                let probe_targets = self.stages_at(&child_stages)?;
                let scheduler =
                    StageScheduler::SourcePartitioned(SourcePartitionedScheduler::new(
                        stage.clone(),
                        source_node,
                        split_source,
                        placement,
                        self.config.split_batch_size,
                        Arc::new(move || {
                            probe_targets.iter().any(|s| s.is_any_task_blocked())
                        }),
                        self.config.blocked_retry_wait,
                    ));
                BuiltStage {
                    stage,
                    scheduler,
                    children: child_stages,
                    writer_finish: None,
                }
            }
            PartitioningHandle::ScaledWriter => {
                let child_stages = self.build_children(children, Some(vec![0]))?;
                let sources = self.stages_at(&child_stages)?;
                let selector = self.placement.create_node_selector(None);
                let scheduler = ScaledWriterScheduler::new(
                    stage.clone(),
                    Arc::new(move || {
                        sources.iter().flat_map(|s| s.task_statuses()).collect()
                    }),
                    selector,
                    self.config.writer_min_size_bytes,
                    self.config.max_writer_tasks,
                    self.config.blocked_retry_wait,
                );
                let finish = scheduler.finish_flag();
                BuiltStage {
                    stage,
                    scheduler: StageScheduler::ScaledWriter(scheduler),
                    children: child_stages,
                    writer_finish: Some(finish),
                }
            }
            handle if !fragment.partitioned_sources.is_empty() => {
                let handle = handle.clone();
                let partition_handles = if fragment.execution.grouped_execution {
                    let handles = self.placement.list_partition_handles(&handle);
                    if handles.is_empty()
                        || handles == [ConnectorPartitionHandle::NotPartitioned]
                    {
                        return Err(DbError::new(
                            "No partition handles available for grouped execution",
                        )
                        .with_field("fragment", fragment.id));
                    }
                    handles
                } else {
                    vec![ConnectorPartitionHandle::NotPartitioned]
                };

                // With only replicated remote inputs the stage is free to
                // assign buckets to nodes itself; otherwise node assignment
                // must agree with the sibling stages of the same handle.
                let replicated_only = fragment
                    .remote_sources
                    .iter()
                    .all(|r| r.exchange == ExchangeKind::Replicate);

                let (nodes, bucket_map, child_b2p) = if replicated_only {
                    let prefer_dynamic = fragment.execution.dynamic_group_schedule;
                    let bucket_map =
                        self.placement.bucket_node_map(&handle, prefer_dynamic)?;
                    if bucket_map.is_dynamic() != prefer_dynamic {
                        return Err(DbError::new(
                            "Bucket node map does not match the requested group schedule",
                        )
                        .with_field("fragment", fragment.id));
                    }
                    let selector =
                        self.placement.create_node_selector(handle.connector());
                    let mut nodes = selector.all_nodes();
                    nodes.shuffle(&mut rand::rng());
                    (nodes, bucket_map, None)
                } else {
                    let map = self.partition_map(&handle)?;
                    let nodes = map.partition_to_node().to_vec();
                    if fragment.execution.grouped_execution
                        && partition_handles.len() != map.bucket_to_partition().len()
                    {
                        return Err(DbError::new(
                            "Partition handle count does not match bucket count",
                        )
                        .with_field("fragment", fragment.id)
                        .with_field("handles", partition_handles.len())
                        .with_field("buckets", map.bucket_to_partition().len()));
                    }
                    let bucket_map = map.as_bucket_node_map();
                    (nodes, bucket_map, Some(map.bucket_to_partition().to_vec()))
                };
                if nodes.is_empty() {
                    return Err(DbError::new("No worker nodes available")
                        .with_code(ErrorCode::NoNodesAvailable));
                }

                let mut sources = Vec::with_capacity(fragment.partitioned_sources.len());
                for source_node in &fragment.partitioned_sources {
                    let split_source = split_sources
                        .remove(source_node)
                        .required("split source for scan node")?;
                    sources.push((*source_node, split_source));
                }

                let child_stages = self.build_children(children, child_b2p)?;

                let scheduler = FixedSourcePartitionedScheduler::new(
                    stage.clone(),
                    nodes,
                    bucket_map,
                    sources,
                    partition_handles,
                    self.config.concurrent_groups_per_node,
                    self.config.split_batch_size,
                    self.config.blocked_retry_wait,
                );
                BuiltStage {
                    stage,
                    scheduler: StageScheduler::FixedSourcePartitioned(scheduler),
                    children: child_stages,
                    writer_finish: None,
                }
            }
            handle => {
                let handle = handle.clone();
                let map = self.partition_map(&handle)?;
                let nodes = map.partition_to_node().to_vec();
                if nodes.is_empty() {
                    return Err(DbError::new("No worker nodes available")
                        .with_code(ErrorCode::NoNodesAvailable));
                }
                let child_stages =
                    self.build_children(children, Some(map.bucket_to_partition().to_vec()))?;
                BuiltStage {
                    stage: stage.clone(),
                    scheduler: StageScheduler::FixedCount(FixedCountScheduler::new(
                        stage, nodes,
                    )),
                    children: child_stages,
                    writer_finish: None,
                }
            }
        };

        self.built[index] = Some(built);
        Ok(index)
    }

    fn build_children(
        &mut self,
        children: Vec<FragmentPlan>,
        bucket_to_partition: Option<Vec<u32>>,
    ) -> Result<Vec<usize>> {
        let mut indexes = Vec::with_capacity(children.len());
        for child in children {
            let child = child.with_bucket_to_partition(bucket_to_partition.clone());
            indexes.push(self.build(child)?);
        }
        Ok(indexes)
    }

    fn stages_at(&self, indexes: &[usize]) -> Result<Vec<Arc<StageExecution>>> {
        indexes
            .iter()
            .map(|&index| {
                self.built[index]
                    .as_ref()
                    .map(|b| b.stage.clone())
                    .required("built child stage")
            })
            .collect()
    }

    fn partition_map(&mut self, handle: &PartitioningHandle) -> Result<NodePartitionMap> {
        if let Some(map) = self.partition_maps.get(handle) {
            return Ok(map.clone());
        }
        let map = self.placement.node_partition_map(handle)?;
        self.partition_maps.insert(handle.clone(), map.clone());
        Ok(map)
    }
}
