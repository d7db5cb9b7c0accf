//! Scheduler for intermediate stages with a fixed task count.
//!
//! These stages read only from remote sources, so all tasks can be created
//! in a single tick, one per output partition of the stage's partitioning.

use std::sync::Arc;

use skiff_error::Result;

use crate::node::WorkerNode;
use crate::scheduler::result::ScheduleResult;
use crate::stage::StageExecution;

pub struct FixedCountScheduler {
    stage: Arc<StageExecution>,
    partition_to_node: Vec<WorkerNode>,
    scheduled: bool,
}

impl FixedCountScheduler {
    pub fn new(stage: Arc<StageExecution>, partition_to_node: Vec<WorkerNode>) -> Self {
        FixedCountScheduler {
            stage,
            partition_to_node,
            scheduled: false,
        }
    }

    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.scheduled {
            return Ok(ScheduleResult::non_blocked(true, Vec::new(), 0));
        }
        self.scheduled = true;

        let mut new_tasks = Vec::with_capacity(self.partition_to_node.len());
        for (partition, node) in self.partition_to_node.iter().enumerate() {
            let task = self.stage.schedule_task(node, partition as u32)?;
            new_tasks.push(task);
        }
        Ok(ScheduleResult::non_blocked(true, new_tasks, 0))
    }
}

impl std::fmt::Debug for FixedCountScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCountScheduler")
            .field("stage_id", &self.stage.stage_id())
            .field("partitions", &self.partition_to_node.len())
            .field("scheduled", &self.scheduled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{QueryId, StageId};
    use crate::stage::StageState;
    use crate::task::RemoteTask;
    use crate::testing::{MockRemoteTaskFactory, fixed_fragment, test_nodes};

    #[test]
    fn one_task_per_partition_in_one_tick() {
        let factory = Arc::new(MockRemoteTaskFactory::new());
        let stage = Arc::new(StageExecution::new(
            StageId::new(QueryId::new(), 0),
            fixed_fragment(0, Vec::new()),
            factory.clone(),
        ));
        let nodes = test_nodes(3);
        let mut scheduler = FixedCountScheduler::new(stage.clone(), nodes.clone());

        let result = scheduler.schedule().unwrap();
        assert!(result.is_finished());
        assert_eq!(3, result.new_tasks().len());
        let task_nodes: Vec<String> = factory
            .tasks()
            .iter()
            .map(|t| t.node().id.clone())
            .collect();
        assert_eq!(
            nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
            task_nodes
        );

        stage.scheduling_complete();
        assert_eq!(StageState::Scheduled, stage.state());

        // Idempotent after the first tick.
        let again = scheduler.schedule().unwrap();
        assert!(again.is_finished());
        assert!(again.new_tasks().is_empty());
        assert_eq!(3, factory.tasks().len());
    }
}
