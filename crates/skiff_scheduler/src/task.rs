//! Remote task handles.
//!
//! A remote task is a unit of work running on a worker node. The scheduler
//! only drives tasks through the [`RemoteTask`] trait; the transport that
//! actually talks to workers implements it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_error::Result;
use url::Url;

use crate::node::WorkerNode;
use crate::plan::{PlanFragmentId, PlanNodeId, StageId};
use crate::scheduler::output_buffer::OutputBufferAssignment;
use crate::split::Split;

/// Identifies a task within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub stage: StageId,
    pub id: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    Running,
    Flushing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub const fn is_done(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }
}

/// Point-in-time status of a remote task as last reported by its worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub location: Url,
    pub node_id: String,
    pub queued_splits: usize,
    pub running_splits: usize,
    pub output_buffered_bytes: u64,
    pub output_buffer_full: bool,
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub user_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub cpu_time: Duration,
    pub failure: Option<String>,
}

/// Handle to a task running on a remote worker.
///
/// All methods are fire-and-forget from the scheduler's perspective; status
/// flows back asynchronously through `status()` and the stage's status
/// change notifications.
pub trait RemoteTask: fmt::Debug + Send + Sync {
    fn task_id(&self) -> TaskId;

    fn node(&self) -> &WorkerNode;

    fn status(&self) -> TaskStatus;

    /// Enqueue splits for a source node within the task.
    fn add_splits(&self, source: PlanNodeId, splits: Vec<Split>);

    /// Signal that a source will receive no further splits.
    fn no_more_splits(&self, source: PlanNodeId);

    /// Tell the task where to read a remote source fragment's output from.
    /// Called repeatedly as upstream tasks appear; `no_more` marks the set
    /// complete.
    fn add_exchange_locations(&self, source_fragment: PlanFragmentId, locations: Vec<Url>, no_more: bool);

    /// Update the task's output buffer layout. May be called repeatedly with
    /// growing assignments; implementations must apply versions in order.
    fn set_output_buffers(&self, buffers: OutputBufferAssignment);

    fn start(&self);

    /// Stop the task, keeping already produced output available to consumers.
    fn cancel(&self);

    /// Stop the task and discard its output.
    fn abort(&self);
}

/// Creates remote tasks on worker nodes.
pub trait RemoteTaskFactory: fmt::Debug + Send + Sync {
    fn create_task(
        &self,
        node: &WorkerNode,
        task_id: TaskId,
        initial_splits: HashMap<PlanNodeId, Vec<Split>>,
    ) -> Result<Arc<dyn RemoteTask>>;
}
