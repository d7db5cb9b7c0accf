//! Output buffer management.
//!
//! As a parent stage gains tasks, its child stages must add matching output
//! buffers so every parent task has a buffer to read from. The strategy
//! depends on the child's output partitioning and is fixed at plan time, so
//! the manager is a closed set of strategies rather than an open trait.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::stage::StageExecution;

/// Identifies one output buffer of a task. For hash-partitioned output the
/// buffer id is the output partition number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputBufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputBufferKind {
    /// Every buffer receives a full copy of the output.
    Broadcast,
    /// Output rows go to any buffer; used for scaled writers and gathers
    /// that do not care about partitioning.
    Arbitrary,
    /// Each row goes to the buffer matching its hash partition.
    Partitioned,
}

/// The buffer layout pushed to every task of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBufferAssignment {
    pub kind: OutputBufferKind,
    /// Buffer id paired with the output partition it serves.
    pub buffers: Vec<(OutputBufferId, u32)>,
    pub no_more_buffers: bool,
    /// Monotonic per stage; tasks apply assignments in version order.
    pub version: u64,
}

impl OutputBufferAssignment {
    pub fn single(kind: OutputBufferKind, buffer: OutputBufferId) -> Self {
        OutputBufferAssignment {
            kind,
            buffers: vec![(buffer, 0)],
            no_more_buffers: true,
            version: 0,
        }
    }
}

struct BufferState {
    assignment: OutputBufferAssignment,
}

/// Grows a child stage's output buffer set as its parent gains tasks.
pub struct OutputBufferManager {
    target: Arc<StageExecution>,
    state: Mutex<BufferState>,
}

impl OutputBufferManager {
    /// Broadcast output: all buffers map to partition 0 and each receives
    /// everything.
    pub fn broadcast(target: Arc<StageExecution>) -> Self {
        Self::with_kind(target, OutputBufferKind::Broadcast)
    }

    /// Arbitrary output: buffers pull from a shared pool, the partition slot
    /// is the order buffers were added in.
    pub fn scaled(target: Arc<StageExecution>) -> Self {
        Self::with_kind(target, OutputBufferKind::Arbitrary)
    }

    fn with_kind(target: Arc<StageExecution>, kind: OutputBufferKind) -> Self {
        OutputBufferManager {
            target,
            state: Mutex::new(BufferState {
                assignment: OutputBufferAssignment {
                    kind,
                    buffers: Vec::new(),
                    no_more_buffers: false,
                    version: 0,
                },
            }),
        }
    }

    /// Partitioned output has a fixed buffer count known at plan time, so
    /// the complete assignment is delivered immediately.
    pub fn partitioned(target: Arc<StageExecution>, partition_count: u32) -> Self {
        let assignment = OutputBufferAssignment {
            kind: OutputBufferKind::Partitioned,
            buffers: (0..partition_count)
                .map(|i| (OutputBufferId(i), i))
                .collect(),
            no_more_buffers: true,
            version: 0,
        };
        target.set_output_buffers(assignment.clone());
        OutputBufferManager {
            target,
            state: Mutex::new(BufferState { assignment }),
        }
    }

    pub fn kind(&self) -> OutputBufferKind {
        self.state.lock().assignment.kind
    }

    /// Add buffers for newly created parent tasks. Duplicate ids are
    /// ignored; adding buffers after `no_more` has been set is ignored too.
    pub fn add_output_buffers(&self, new_buffers: &[OutputBufferId], no_more: bool) {
        let updated = {
            let mut state = self.state.lock();
            if state.assignment.kind == OutputBufferKind::Partitioned {
                // Layout is fixed at construction.
                return;
            }
            if state.assignment.no_more_buffers {
                return;
            }
            let mut changed = false;
            for &id in new_buffers {
                if state.assignment.buffers.iter().any(|(b, _)| *b == id) {
                    continue;
                }
                let partition = match state.assignment.kind {
                    OutputBufferKind::Broadcast => 0,
                    OutputBufferKind::Arbitrary => state.assignment.buffers.len() as u32,
                    OutputBufferKind::Partitioned => unreachable!(),
                };
                state.assignment.buffers.push((id, partition));
                changed = true;
            }
            if no_more && !state.assignment.no_more_buffers {
                state.assignment.no_more_buffers = true;
                changed = true;
            }
            if changed {
                state.assignment.version += 1;
                Some(state.assignment.clone())
            } else {
                None
            }
        };
        if let Some(assignment) = updated {
            self.target.set_output_buffers(assignment);
        }
    }

    pub fn current_assignment(&self) -> OutputBufferAssignment {
        self.state.lock().assignment.clone()
    }
}

impl std::fmt::Debug for OutputBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBufferManager")
            .field("target", &self.target.stage_id())
            .field("assignment", &self.current_assignment())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanNodeId, QueryId, StageId};
    use crate::testing::{MockRemoteTaskFactory, source_fragment, test_nodes};

    fn stage_with_task() -> (Arc<StageExecution>, Arc<crate::testing::MockRemoteTask>) {
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let stage = Arc::new(StageExecution::new(
            StageId::new(QueryId::new(), 1),
            source_fragment(1, PlanNodeId(1)),
            factory.clone(),
        ));
        stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        let task = factory.tasks().remove(0);
        (stage, task)
    }

    #[test]
    fn broadcast_maps_everything_to_partition_zero() {
        let (stage, task) = stage_with_task();
        let manager = OutputBufferManager::broadcast(stage);

        manager.add_output_buffers(&[OutputBufferId(0), OutputBufferId(1)], false);
        manager.add_output_buffers(&[OutputBufferId(1), OutputBufferId(2)], true);

        let assignment = task.buffer_assignment().unwrap();
        assert_eq!(OutputBufferKind::Broadcast, assignment.kind);
        assert_eq!(
            vec![
                (OutputBufferId(0), 0),
                (OutputBufferId(1), 0),
                (OutputBufferId(2), 0),
            ],
            assignment.buffers
        );
        assert!(assignment.no_more_buffers);

        // Closed set, further additions are ignored.
        manager.add_output_buffers(&[OutputBufferId(9)], false);
        assert_eq!(3, manager.current_assignment().buffers.len());
    }

    #[test]
    fn scaled_assigns_insertion_order_partitions() {
        let (stage, task) = stage_with_task();
        let manager = OutputBufferManager::scaled(stage);

        manager.add_output_buffers(&[OutputBufferId(5)], false);
        manager.add_output_buffers(&[OutputBufferId(7)], false);

        let assignment = task.buffer_assignment().unwrap();
        assert_eq!(
            vec![(OutputBufferId(5), 0), (OutputBufferId(7), 1)],
            assignment.buffers
        );
        assert!(!assignment.no_more_buffers);
    }

    #[test]
    fn partitioned_layout_is_fixed_at_construction() {
        let (stage, task) = stage_with_task();
        let manager = OutputBufferManager::partitioned(stage, 3);

        let assignment = task.buffer_assignment().unwrap();
        assert_eq!(3, assignment.buffers.len());
        assert!(assignment.no_more_buffers);

        manager.add_output_buffers(&[OutputBufferId(9)], true);
        assert_eq!(3, manager.current_assignment().buffers.len());
    }

    #[test]
    fn versions_increase_per_change() {
        let (stage, _task) = stage_with_task();
        let manager = OutputBufferManager::scaled(stage);
        assert_eq!(0, manager.current_assignment().version);
        manager.add_output_buffers(&[OutputBufferId(0)], false);
        assert_eq!(1, manager.current_assignment().version);
        // Duplicate id, no change.
        manager.add_output_buffers(&[OutputBufferId(0)], false);
        assert_eq!(1, manager.current_assignment().version);
        manager.add_output_buffers(&[], true);
        assert_eq!(2, manager.current_assignment().version);
    }
}
