//! Test doubles for scheduler tests.
//!
//! Everything here is deterministic and in-memory: split sources replay a
//! fixed split list, remote tasks record what the scheduler sends them, and
//! node placement serves a static node list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use skiff_error::{DbError, Result};
use url::Url;

use crate::node::{
    BucketNodeMap,
    ConnectorPartitionHandle,
    NodePartitionMap,
    NodePlacement,
    NodeSelector,
    WorkerNode,
};
use crate::plan::{
    ExecutionDescriptor,
    FragmentPlan,
    PartitioningHandle,
    PlanFragment,
    PlanFragmentId,
    PlanNodeId,
    RemoteSourceNode,
};
use crate::scheduler::output_buffer::OutputBufferAssignment;
use crate::split::{Split, SplitBatch, SplitFetch, SplitSource};
use crate::task::{RemoteTask, RemoteTaskFactory, TaskId, TaskState, TaskStatus};

pub fn test_nodes(count: usize) -> Vec<WorkerNode> {
    (0..count)
        .map(|i| WorkerNode {
            id: format!("node{i}"),
            address: Url::parse(&format!("http://node{i}:8080")).unwrap(),
        })
        .collect()
}

/// Split source that serves a fixed split list in fetch-sized batches.
#[derive(Debug)]
pub struct MockSplitSource {
    splits: Vec<Split>,
    blocked: bool,
    closed: bool,
    catalog: Option<String>,
}

impl MockSplitSource {
    pub fn with_splits(splits: Vec<Split>) -> Self {
        MockSplitSource {
            splits,
            blocked: false,
            closed: false,
            catalog: None,
        }
    }

    pub fn with_split_count(count: usize) -> Self {
        Self::with_splits((0..count as u64).map(Split::new).collect())
    }

    /// A source whose fetch never completes.
    pub fn pending() -> Self {
        MockSplitSource {
            splits: Vec::new(),
            blocked: true,
            closed: false,
            catalog: None,
        }
    }

    pub fn closed(&self) -> bool {
        self.closed
    }
}

impl SplitSource for MockSplitSource {
    fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    fn fetch_next_batch(&mut self, max_size: usize) -> Result<SplitFetch> {
        if self.blocked {
            return Ok(SplitFetch::Pending(futures::future::pending().boxed()));
        }
        let take = max_size.min(self.splits.len());
        let splits: Vec<Split> = self.splits.drain(..take).collect();
        Ok(SplitFetch::Ready(SplitBatch {
            splits,
            no_more_splits: self.splits.is_empty(),
        }))
    }

    fn is_finished(&self) -> bool {
        !self.blocked && self.splits.is_empty()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct MockTaskInner {
    status: TaskStatus,
    splits: HashMap<PlanNodeId, Vec<Split>>,
    no_more: HashSet<PlanNodeId>,
    buffers: Option<OutputBufferAssignment>,
    exchange_locations: HashMap<PlanFragmentId, (Vec<Url>, bool)>,
}

/// Remote task that records everything the scheduler sends it. Task state is
/// driven manually from tests.
pub struct MockRemoteTask {
    task_id: TaskId,
    node: WorkerNode,
    inner: Mutex<MockTaskInner>,
    started: AtomicBool,
}

impl MockRemoteTask {
    pub fn new(node: WorkerNode, task_id: TaskId) -> Self {
        let location = Url::parse(&format!(
            "http://{}:8080/v1/task/{task_id}",
            node.id
        ))
        .unwrap();
        let status = TaskStatus {
            task_id,
            state: TaskState::Planned,
            location,
            node_id: node.id.clone(),
            queued_splits: 0,
            running_splits: 0,
            output_buffered_bytes: 0,
            output_buffer_full: false,
            rows_processed: 0,
            bytes_processed: 0,
            user_memory_bytes: 0,
            total_memory_bytes: 0,
            cpu_time: Duration::ZERO,
            failure: None,
        };
        MockRemoteTask {
            task_id,
            node,
            inner: Mutex::new(MockTaskInner {
                status,
                splits: HashMap::new(),
                no_more: HashSet::new(),
                buffers: None,
                exchange_locations: HashMap::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, state: TaskState) {
        self.inner.lock().status.state = state;
    }

    pub fn set_failure(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.status.state = TaskState::Failed;
        inner.status.failure = Some(message.into());
    }

    pub fn set_output_buffered_bytes(&self, bytes: u64) {
        self.inner.lock().status.output_buffered_bytes = bytes;
    }

    pub fn set_output_buffer_full(&self, full: bool) {
        self.inner.lock().status.output_buffer_full = full;
    }

    pub fn set_queued_splits(&self, queued: usize) {
        self.inner.lock().status.queued_splits = queued;
    }

    pub fn set_bytes_processed(&self, bytes: u64) {
        self.inner.lock().status.bytes_processed = bytes;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn splits_for(&self, source: PlanNodeId) -> Vec<Split> {
        self.inner
            .lock()
            .splits
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }

    pub fn no_more_splits_for(&self, source: PlanNodeId) -> bool {
        self.inner.lock().no_more.contains(&source)
    }

    pub fn buffer_assignment(&self) -> Option<OutputBufferAssignment> {
        self.inner.lock().buffers.clone()
    }

    pub fn exchange_locations_for(&self, fragment: PlanFragmentId) -> (Vec<Url>, bool) {
        self.inner
            .lock()
            .exchange_locations
            .get(&fragment)
            .cloned()
            .unwrap_or((Vec::new(), false))
    }
}

impl RemoteTask for MockRemoteTask {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn node(&self) -> &WorkerNode {
        &self.node
    }

    fn status(&self) -> TaskStatus {
        self.inner.lock().status.clone()
    }

    fn add_splits(&self, source: PlanNodeId, splits: Vec<Split>) {
        let mut inner = self.inner.lock();
        inner.status.queued_splits += splits.len();
        inner.splits.entry(source).or_default().extend(splits);
    }

    fn no_more_splits(&self, source: PlanNodeId) {
        self.inner.lock().no_more.insert(source);
    }

    fn add_exchange_locations(
        &self,
        source_fragment: PlanFragmentId,
        locations: Vec<Url>,
        no_more: bool,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner
            .exchange_locations
            .entry(source_fragment)
            .or_insert_with(|| (Vec::new(), false));
        entry.0.extend(locations);
        entry.1 |= no_more;
    }

    fn set_output_buffers(&self, buffers: OutputBufferAssignment) {
        self.inner.lock().buffers = Some(buffers);
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn cancel(&self) {
        let mut inner = self.inner.lock();
        if !inner.status.state.is_done() {
            inner.status.state = TaskState::Canceled;
        }
    }

    fn abort(&self) {
        let mut inner = self.inner.lock();
        if !inner.status.state.is_done() {
            inner.status.state = TaskState::Aborted;
        }
    }
}

impl std::fmt::Debug for MockRemoteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemoteTask")
            .field("task_id", &self.task_id)
            .field("node", &self.node.id)
            .finish_non_exhaustive()
    }
}

/// Factory that creates [`MockRemoteTask`]s and remembers them.
#[derive(Debug, Default)]
pub struct MockRemoteTaskFactory {
    tasks: Mutex<Vec<Arc<MockRemoteTask>>>,
    fail_next: AtomicBool,
}

impl MockRemoteTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Arc<MockRemoteTask>> {
        self.tasks.lock().clone()
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl RemoteTaskFactory for MockRemoteTaskFactory {
    fn create_task(
        &self,
        node: &WorkerNode,
        task_id: TaskId,
        initial_splits: HashMap<PlanNodeId, Vec<Split>>,
    ) -> Result<Arc<dyn RemoteTask>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DbError::new("Task creation failed").with_field("task_id", task_id));
        }
        let task = Arc::new(MockRemoteTask::new(node.clone(), task_id));
        for (source, splits) in initial_splits {
            task.add_splits(source, splits);
        }
        self.tasks.lock().push(task.clone());
        Ok(task)
    }
}

#[derive(Debug)]
struct StaticNodeSelector {
    nodes: Vec<WorkerNode>,
}

impl NodeSelector for StaticNodeSelector {
    fn all_nodes(&self) -> Vec<WorkerNode> {
        self.nodes.clone()
    }
}

/// Node placement over a static node list. Partition maps assign one
/// partition per node with an identity bucket map.
#[derive(Debug)]
pub struct StaticNodePlacement {
    nodes: Vec<WorkerNode>,
    partition_handles: Vec<ConnectorPartitionHandle>,
}

impl StaticNodePlacement {
    pub fn new(nodes: Vec<WorkerNode>) -> Self {
        StaticNodePlacement {
            nodes,
            partition_handles: vec![ConnectorPartitionHandle::NotPartitioned],
        }
    }

    pub fn with_partition_handles(
        mut self,
        handles: Vec<ConnectorPartitionHandle>,
    ) -> Self {
        self.partition_handles = handles;
        self
    }
}

impl NodePlacement for StaticNodePlacement {
    fn create_node_selector(&self, _catalog: Option<&str>) -> Arc<dyn NodeSelector> {
        Arc::new(StaticNodeSelector {
            nodes: self.nodes.clone(),
        })
    }

    fn node_partition_map(&self, _handle: &PartitioningHandle) -> Result<NodePartitionMap> {
        NodePartitionMap::new(
            self.nodes.clone(),
            (0..self.nodes.len() as u32).collect(),
        )
    }

    fn bucket_node_map(
        &self,
        handle: &PartitioningHandle,
        prefer_dynamic: bool,
    ) -> Result<BucketNodeMap> {
        if prefer_dynamic {
            Ok(BucketNodeMap::dynamic())
        } else {
            Ok(self.node_partition_map(handle)?.as_bucket_node_map())
        }
    }

    fn list_partition_handles(
        &self,
        _handle: &PartitioningHandle,
    ) -> Vec<ConnectorPartitionHandle> {
        self.partition_handles.clone()
    }
}

/// A leaf scan fragment.
pub fn source_fragment(id: usize, source: PlanNodeId) -> PlanFragment {
    PlanFragment {
        id: PlanFragmentId(id),
        partitioning: PartitioningHandle::Source,
        output_partitioning: PartitioningHandle::FixedHash,
        partitioned_sources: vec![source],
        remote_sources: Vec::new(),
        execution: ExecutionDescriptor::default(),
        bucket_to_partition: None,
    }
}

/// An intermediate fragment reading only from remote sources.
pub fn fixed_fragment(id: usize, remote_sources: Vec<RemoteSourceNode>) -> PlanFragment {
    PlanFragment {
        id: PlanFragmentId(id),
        partitioning: PartitioningHandle::FixedHash,
        output_partitioning: PartitioningHandle::FixedHash,
        partitioned_sources: Vec::new(),
        remote_sources,
        execution: ExecutionDescriptor::default(),
        bucket_to_partition: None,
    }
}

pub fn fragment_plan(
    fragment: PlanFragment,
    split_sources: Vec<(PlanNodeId, Box<dyn SplitSource>)>,
    children: Vec<FragmentPlan>,
) -> FragmentPlan {
    FragmentPlan {
        fragment,
        split_sources: split_sources.into_iter().collect(),
        children,
    }
}
