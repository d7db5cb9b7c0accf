//! Stage linkage.
//!
//! After each scheduler tick the new tasks of a stage must be propagated in
//! two directions: upward to the parent as exchange locations, and downward
//! to child stages as new output buffers.

use std::sync::Arc;

use crate::plan::{PlanFragmentId, StageId};
use crate::scheduler::output_buffer::{OutputBufferId, OutputBufferManager};
use crate::stage::StageState;
use crate::task::RemoteTask;

/// Receives the exchange locations of a child stage's tasks. For the root
/// stage this feeds the query output locations instead of a parent stage.
pub type ExchangeLocationsConsumer =
    Arc<dyn Fn(PlanFragmentId, &[Arc<dyn RemoteTask>], bool) + Send + Sync>;

pub struct StageLinkage {
    fragment_id: PlanFragmentId,
    parent: ExchangeLocationsConsumer,
    child_buffer_managers: Vec<OutputBufferManager>,
    child_stage_ids: Vec<StageId>,
}

impl StageLinkage {
    pub fn new(
        fragment_id: PlanFragmentId,
        parent: ExchangeLocationsConsumer,
        child_buffer_managers: Vec<OutputBufferManager>,
        child_stage_ids: Vec<StageId>,
    ) -> Self {
        StageLinkage {
            fragment_id,
            parent,
            child_buffer_managers,
            child_stage_ids,
        }
    }

    pub fn child_stage_ids(&self) -> &[StageId] {
        &self.child_stage_ids
    }

    /// Propagate one tick's worth of new tasks. Must be called even with no
    /// new tasks once the stage stops accepting tasks so that the final
    /// no-more flags are delivered.
    pub fn process_schedule_results(&self, state: StageState, new_tasks: &[Arc<dyn RemoteTask>]) {
        let no_more_tasks = !state.can_schedule_more_tasks();

        (self.parent)(self.fragment_id, new_tasks, no_more_tasks);

        let buffer_ids: Vec<OutputBufferId> = new_tasks
            .iter()
            .map(|task| OutputBufferId(task.task_id().id))
            .collect();
        for manager in &self.child_buffer_managers {
            manager.add_output_buffers(&buffer_ids, no_more_tasks);
        }
    }
}

impl std::fmt::Debug for StageLinkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLinkage")
            .field("fragment_id", &self.fragment_id)
            .field("child_stage_ids", &self.child_stage_ids)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::plan::{PlanNodeId, QueryId};
    use crate::scheduler::output_buffer::OutputBufferManager;
    use crate::stage::StageExecution;
    use crate::testing::{MockRemoteTaskFactory, source_fragment, test_nodes};

    #[test]
    fn results_flow_up_and_down() {
        let query = QueryId::new();
        let factory = Arc::new(MockRemoteTaskFactory::new());

        let parent_stage = Arc::new(StageExecution::new(
            StageId::new(query, 0),
            source_fragment(0, PlanNodeId(1)),
            factory.clone(),
        ));
        let child_stage = Arc::new(StageExecution::new(
            StageId::new(query, 1),
            source_fragment(1, PlanNodeId(2)),
            factory.clone(),
        ));
        child_stage.schedule_task(&test_nodes(1)[0], 0).unwrap();
        let child_task = factory.tasks().remove(0);

        let seen: Arc<Mutex<Vec<(PlanFragmentId, usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let linkage = StageLinkage::new(
            PlanFragmentId(0),
            Arc::new(move |fragment, tasks, no_more| {
                sink.lock().push((fragment, tasks.len(), no_more));
            }),
            vec![OutputBufferManager::broadcast(child_stage.clone())],
            vec![child_stage.stage_id()],
        );

        let task = parent_stage.schedule_task(&test_nodes(2)[1], 0).unwrap();
        linkage.process_schedule_results(StageState::Scheduling, &[task]);
        assert_eq!(vec![(PlanFragmentId(0), 1, false)], seen.lock().clone());
        let assignment = child_task.buffer_assignment().unwrap();
        assert_eq!(1, assignment.buffers.len());
        assert!(!assignment.no_more_buffers);

        // Once the stage stops accepting tasks the no-more flags go out,
        // even with no new tasks.
        linkage.process_schedule_results(StageState::Scheduled, &[]);
        assert_eq!((PlanFragmentId(0), 0, true), seen.lock()[1]);
        assert!(child_task.buffer_assignment().unwrap().no_more_buffers);
    }
}
