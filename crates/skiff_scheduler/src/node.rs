//! Worker nodes and node placement.
//!
//! Node discovery and catalog-aware placement live outside this crate; the
//! scheduler consumes them through [`NodePlacement`] and [`NodeSelector`].
//! [`DynamicSplitPlacement`] is the placement policy used by
//! source-partitioned stages: it spreads splits over available nodes while
//! respecting per-node queue limits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skiff_error::{DbError, ErrorCode, Result};
use url::Url;

use crate::plan::PartitioningHandle;
use crate::split::Split;
use crate::task::TaskStatus;

/// A worker node that can host remote tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: String,
    pub address: Url,
}

/// Maps logical output partitions to physical nodes for one partitioning
/// handle.
///
/// Resolved once per query and cached so that every stage sharing a handle
/// sees identical machine assignment; sibling stages disagreeing on the
/// bucket-to-node mapping would corrupt co-located execution.
#[derive(Debug, Clone)]
pub struct NodePartitionMap {
    partition_to_node: Vec<WorkerNode>,
    bucket_to_partition: Vec<u32>,
}

impl NodePartitionMap {
    pub fn new(partition_to_node: Vec<WorkerNode>, bucket_to_partition: Vec<u32>) -> Result<Self> {
        let partitions = partition_to_node.len();
        for &partition in &bucket_to_partition {
            if partition as usize >= partitions {
                return Err(DbError::new("Bucket references an unknown partition")
                    .with_field("partition", partition)
                    .with_field("partition_count", partitions));
            }
        }
        Ok(NodePartitionMap {
            partition_to_node,
            bucket_to_partition,
        })
    }

    pub fn partition_to_node(&self) -> &[WorkerNode] {
        &self.partition_to_node
    }

    pub fn bucket_to_partition(&self) -> &[u32] {
        &self.bucket_to_partition
    }

    /// Collapse the two-level bucket -> partition -> node mapping into a
    /// fixed bucket -> node map.
    pub fn as_bucket_node_map(&self) -> BucketNodeMap {
        let assignments = self
            .bucket_to_partition
            .iter()
            .map(|&partition| self.partition_to_node[partition as usize].clone())
            .collect();
        BucketNodeMap::fixed(assignments)
    }
}

/// Maps buckets to nodes. Either fixed up front or dynamic, in which case the
/// scheduler assigns buckets to nodes lazily but deterministically.
#[derive(Debug, Clone)]
pub struct BucketNodeMap {
    assignments: Option<Vec<WorkerNode>>,
}

impl BucketNodeMap {
    pub fn fixed(assignments: Vec<WorkerNode>) -> Self {
        BucketNodeMap {
            assignments: Some(assignments),
        }
    }

    pub fn dynamic() -> Self {
        BucketNodeMap { assignments: None }
    }

    pub fn is_dynamic(&self) -> bool {
        self.assignments.is_none()
    }

    pub fn assigned_node(&self, bucket: u32) -> Option<&WorkerNode> {
        self.assignments
            .as_ref()
            .and_then(|nodes| nodes.get(bucket as usize))
    }
}

/// A connector-provided partition handle, one per execution group under
/// grouped execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorPartitionHandle {
    /// The source is not partitioned; the whole stage is one group.
    NotPartitioned,
    Bucket(u32),
}

/// Selects candidate nodes for a stage, optionally constrained to a catalog.
pub trait NodeSelector: fmt::Debug + Send + Sync {
    fn all_nodes(&self) -> Vec<WorkerNode>;
}

/// Resolves node assignment for partitioning handles.
pub trait NodePlacement: fmt::Debug + Send + Sync {
    fn create_node_selector(&self, catalog: Option<&str>) -> Arc<dyn NodeSelector>;

    fn node_partition_map(&self, handle: &PartitioningHandle) -> Result<NodePartitionMap>;

    fn bucket_node_map(
        &self,
        handle: &PartitioningHandle,
        prefer_dynamic: bool,
    ) -> Result<BucketNodeMap>;

    fn list_partition_handles(
        &self,
        handle: &PartitioningHandle,
    ) -> Vec<ConnectorPartitionHandle>;
}

/// Result of one placement round: per-node assignments plus the splits that
/// found no capacity this round.
#[derive(Debug)]
pub struct SplitPlacementResult {
    pub assignments: Vec<(WorkerNode, Vec<Split>)>,
    pub unplaced: Vec<Split>,
}

/// Provides the current task statuses of the stage being placed.
pub type TaskStatusProvider = Arc<dyn Fn() -> Vec<TaskStatus> + Send + Sync>;

/// Dynamic split placement for source-partitioned stages.
///
/// Spreads splits round-robin over the selector's nodes, skipping nodes whose
/// split queues are at capacity. Splits that cannot be placed are returned so
/// the scheduler can report `SPLIT_QUEUES_FULL` and retry.
pub struct DynamicSplitPlacement {
    selector: Arc<dyn NodeSelector>,
    task_statuses: TaskStatusProvider,
    max_splits_per_node: usize,
    max_splits_per_round: usize,
}

impl DynamicSplitPlacement {
    pub fn new(
        selector: Arc<dyn NodeSelector>,
        task_statuses: TaskStatusProvider,
        max_splits_per_node: usize,
        max_splits_per_round: usize,
    ) -> Self {
        DynamicSplitPlacement {
            selector,
            task_statuses,
            max_splits_per_node,
            max_splits_per_round,
        }
    }

    pub fn nodes(&self) -> Vec<WorkerNode> {
        self.selector.all_nodes()
    }

    pub fn compute_assignments(&self, splits: Vec<Split>) -> Result<SplitPlacementResult> {
        let nodes = self.selector.all_nodes();
        if nodes.is_empty() {
            return Err(DbError::new("No worker nodes available")
                .with_code(ErrorCode::NoNodesAvailable));
        }

        let mut queued: HashMap<String, usize> = HashMap::new();
        for status in (self.task_statuses)() {
            let count = status.queued_splits + status.running_splits;
            *queued.entry(status.node_id).or_default() += count;
        }

        let mut capacity: Vec<usize> = nodes
            .iter()
            .map(|node| {
                let used = queued.get(&node.id).copied().unwrap_or(0);
                self.max_splits_per_node
                    .saturating_sub(used)
                    .min(self.max_splits_per_round)
            })
            .collect();

        let mut assignments: Vec<(WorkerNode, Vec<Split>)> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        let mut unplaced = Vec::new();
        let mut cursor = 0;

        'splits: for split in splits {
            for _ in 0..nodes.len() {
                let idx = cursor % nodes.len();
                cursor += 1;
                if capacity[idx] > 0 {
                    capacity[idx] -= 1;
                    assignments[idx].1.push(split);
                    continue 'splits;
                }
            }
            unplaced.push(split);
        }

        assignments.retain(|(_, splits)| !splits.is_empty());
        Ok(SplitPlacementResult {
            assignments,
            unplaced,
        })
    }
}

impl fmt::Debug for DynamicSplitPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicSplitPlacement")
            .field("selector", &self.selector)
            .field("max_splits_per_node", &self.max_splits_per_node)
            .field("max_splits_per_round", &self.max_splits_per_round)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskState};
    use crate::testing::test_nodes;
    use crate::plan::{QueryId, StageId};
    use std::time::Duration;

    fn status_for(node: &WorkerNode, queued: usize) -> TaskStatus {
        TaskStatus {
            task_id: TaskId {
                stage: StageId::new(QueryId::new(), 0),
                id: 0,
            },
            state: TaskState::Running,
            location: node.address.clone(),
            node_id: node.id.clone(),
            queued_splits: queued,
            running_splits: 0,
            output_buffered_bytes: 0,
            output_buffer_full: false,
            rows_processed: 0,
            bytes_processed: 0,
            user_memory_bytes: 0,
            total_memory_bytes: 0,
            cpu_time: Duration::ZERO,
            failure: None,
        }
    }

    #[derive(Debug)]
    struct FixedSelector(Vec<WorkerNode>);

    impl NodeSelector for FixedSelector {
        fn all_nodes(&self) -> Vec<WorkerNode> {
            self.0.clone()
        }
    }

    #[test]
    fn bucket_node_map_from_partition_map() {
        let nodes = test_nodes(2);
        let map = NodePartitionMap::new(nodes.clone(), vec![0, 1, 0]).unwrap();
        let bucket_map = map.as_bucket_node_map();
        assert!(!bucket_map.is_dynamic());
        assert_eq!(Some(&nodes[0]), bucket_map.assigned_node(0));
        assert_eq!(Some(&nodes[1]), bucket_map.assigned_node(1));
        assert_eq!(Some(&nodes[0]), bucket_map.assigned_node(2));
        assert_eq!(None, bucket_map.assigned_node(3));
    }

    #[test]
    fn partition_map_rejects_unknown_partition() {
        let nodes = test_nodes(2);
        NodePartitionMap::new(nodes, vec![0, 2]).unwrap_err();
    }

    #[test]
    fn assignments_spread_round_robin() {
        let nodes = test_nodes(2);
        let placement = DynamicSplitPlacement::new(
            Arc::new(FixedSelector(nodes.clone())),
            Arc::new(Vec::new),
            100,
            100,
        );
        let result = placement
            .compute_assignments((0..4).map(Split::new).collect())
            .unwrap();
        assert!(result.unplaced.is_empty());
        assert_eq!(2, result.assignments.len());
        for (_, splits) in &result.assignments {
            assert_eq!(2, splits.len());
        }
    }

    #[test]
    fn full_queues_leave_splits_unplaced() {
        let nodes = test_nodes(2);
        let busy = nodes[0].clone();
        let placement = DynamicSplitPlacement::new(
            Arc::new(FixedSelector(nodes.clone())),
            Arc::new(move || vec![status_for(&busy, 10)]),
            10,
            100,
        );
        let result = placement
            .compute_assignments((0..12).map(Split::new).collect())
            .unwrap();
        // node0 is at capacity, node1 takes its limit of 10, 2 are left.
        assert_eq!(1, result.assignments.len());
        assert_eq!(nodes[1].id, result.assignments[0].0.id);
        assert_eq!(10, result.assignments[0].1.len());
        assert_eq!(2, result.unplaced.len());
    }

    #[test]
    fn no_nodes_is_an_error() {
        let placement = DynamicSplitPlacement::new(
            Arc::new(FixedSelector(Vec::new())),
            Arc::new(Vec::new),
            10,
            10,
        );
        let err = placement.compute_assignments(vec![Split::new(0)]).unwrap_err();
        assert_eq!(ErrorCode::NoNodesAvailable, err.code());
    }
}
