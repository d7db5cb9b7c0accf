//! Plan-side value types consumed by the scheduler.
//!
//! The planner hands the scheduler a tree of [`FragmentPlan`]s: one plan
//! fragment per stage, together with the split sources feeding the fragment's
//! table scans and the child plans feeding its remote exchanges. The scheduler
//! never looks inside a fragment's operator tree; the partitioning handle and
//! source composition are enough to pick a scheduling strategy.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::split::SplitSource;

/// Identifies a single query.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        QueryId(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one stage within a query.
///
/// Indexes are assigned by a single counter during graph construction; a
/// parent stage always has a lower index than any of its descendants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StageId {
    pub query: QueryId,
    pub index: usize,
}

impl StageId {
    pub fn new(query: QueryId, index: usize) -> Self {
        StageId { query, index }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query, self.index)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PlanFragmentId(pub usize);

impl fmt::Display for PlanFragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a plan node within a fragment. Split sources are keyed on the
/// scan node they feed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PlanNodeId(pub u64);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a stage's work (or output) is distributed across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitioningHandle {
    /// Placement is driven dynamically by the stage's splits and current
    /// system load.
    Source,
    /// Writer tasks are added elastically based on upstream data volume.
    ScaledWriter,
    /// Every consumer receives the full output.
    Broadcast,
    /// System hash distribution across a fixed set of nodes.
    FixedHash,
    /// Connector-defined bucketed distribution, enabling co-located and
    /// grouped execution.
    ConnectorBucketed { connector: String },
}

impl PartitioningHandle {
    /// The connector owning this distribution, if any.
    pub fn connector(&self) -> Option<&str> {
        match self {
            PartitioningHandle::ConnectorBucketed { connector } => Some(connector),
            _ => None,
        }
    }
}

/// The exchange type of a remote source feeding a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Repartition,
    Replicate,
    Gather,
}

/// A remote exchange input of a fragment: data arriving from a child stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSourceNode {
    pub source_fragment: PlanFragmentId,
    pub exchange: ExchangeKind,
}

/// Planner decisions about grouped (per-execution-group) scheduling for a
/// stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDescriptor {
    /// Whether the stage runs as independently scheduled execution groups.
    pub grouped_execution: bool,
    /// Whether buckets may be assigned to nodes lazily instead of through a
    /// fixed bucket-to-node map.
    pub dynamic_group_schedule: bool,
}

/// The plan fragment a single stage executes.
#[derive(Debug, Clone)]
pub struct PlanFragment {
    pub id: PlanFragmentId,
    /// How the stage's execution is partitioned across nodes.
    pub partitioning: PartitioningHandle,
    /// How the stage's output is partitioned for its parent. Drives the
    /// parent's choice of output-buffer strategy.
    pub output_partitioning: PartitioningHandle,
    /// Scan nodes fed by local split sources, in scheduling order.
    pub partitioned_sources: Vec<PlanNodeId>,
    /// Remote exchange inputs fed by child stages.
    pub remote_sources: Vec<RemoteSourceNode>,
    pub execution: ExecutionDescriptor,
    /// Bucket-to-output-partition map threaded down from the parent stage
    /// during graph construction. Determines the stage's output buffer count
    /// under partitioned output.
    pub bucket_to_partition: Option<Vec<u32>>,
}

/// One node of the fragment tree handed to the scheduler: a fragment plus its
/// split sources and child plans.
#[derive(Debug)]
pub struct FragmentPlan {
    pub fragment: PlanFragment,
    pub split_sources: HashMap<PlanNodeId, Box<dyn SplitSource>>,
    pub children: Vec<FragmentPlan>,
}

impl FragmentPlan {
    /// Replace the fragment's bucket-to-partition map.
    pub fn with_bucket_to_partition(mut self, bucket_to_partition: Option<Vec<u32>>) -> Self {
        self.fragment.bucket_to_partition = bucket_to_partition;
        self
    }
}
