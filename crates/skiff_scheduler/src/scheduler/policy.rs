//! Execution policies.
//!
//! A policy decides which stages the scheduling loop works on during each
//! iteration. All-at-once schedules every stage immediately; phased walks
//! the stage tree bottom-up so producers exist before their consumers start.

use std::fmt;
use std::sync::Arc;

use crate::stage::StageExecution;

pub trait ExecutionPolicy: fmt::Debug + Send {
    fn create_execution_schedule(
        &self,
        stages: Vec<Arc<StageExecution>>,
    ) -> Box<dyn ExecutionSchedule>;
}

pub trait ExecutionSchedule: Send {
    fn is_finished(&mut self) -> bool;

    /// Stages eligible for scheduling this iteration. Stages that are done
    /// scheduling must not be returned.
    fn stages_to_schedule(&mut self) -> Vec<Arc<StageExecution>>;
}

#[derive(Debug, Default)]
pub struct AllAtOncePolicy;

impl ExecutionPolicy for AllAtOncePolicy {
    fn create_execution_schedule(
        &self,
        stages: Vec<Arc<StageExecution>>,
    ) -> Box<dyn ExecutionSchedule> {
        Box::new(AllAtOnceSchedule { stages })
    }
}

struct AllAtOnceSchedule {
    stages: Vec<Arc<StageExecution>>,
}

impl ExecutionSchedule for AllAtOnceSchedule {
    fn is_finished(&mut self) -> bool {
        self.stages.retain(|s| !s.state().is_scheduling_done());
        self.stages.is_empty()
    }

    fn stages_to_schedule(&mut self) -> Vec<Arc<StageExecution>> {
        self.stages
            .iter()
            .filter(|s| !s.state().is_scheduling_done())
            .cloned()
            .collect()
    }
}

/// Schedules one stage at a time, leaves first. Stage ids are assigned
/// parent-before-child during graph construction, so reverse id order visits
/// every producer before its consumers.
#[derive(Debug, Default)]
pub struct PhasedPolicy;

impl ExecutionPolicy for PhasedPolicy {
    fn create_execution_schedule(
        &self,
        mut stages: Vec<Arc<StageExecution>>,
    ) -> Box<dyn ExecutionSchedule> {
        stages.sort_by(|a, b| b.stage_id().index.cmp(&a.stage_id().index));
        Box::new(PhasedSchedule { phases: stages })
    }
}

struct PhasedSchedule {
    phases: Vec<Arc<StageExecution>>,
}

impl ExecutionSchedule for PhasedSchedule {
    fn is_finished(&mut self) -> bool {
        self.phases.retain(|s| !s.state().is_scheduling_done());
        self.phases.is_empty()
    }

    fn stages_to_schedule(&mut self) -> Vec<Arc<StageExecution>> {
        self.phases
            .iter()
            .find(|s| !s.state().is_scheduling_done())
            .cloned()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanNodeId, QueryId, StageId};
    use crate::testing::{MockRemoteTaskFactory, source_fragment};

    fn stages(count: usize) -> Vec<Arc<StageExecution>> {
        let query = QueryId::new();
        let factory = Arc::new(MockRemoteTaskFactory::new());
        (0..count)
            .map(|i| {
                Arc::new(StageExecution::new(
                    StageId::new(query, i),
                    source_fragment(i, PlanNodeId(1)),
                    factory.clone(),
                ))
            })
            .collect()
    }

    #[test]
    fn all_at_once_schedules_everything() {
        let stages = stages(3);
        let mut schedule = AllAtOncePolicy.create_execution_schedule(stages.clone());
        assert!(!schedule.is_finished());
        assert_eq!(3, schedule.stages_to_schedule().len());

        stages[1].scheduling_complete();
        assert_eq!(2, schedule.stages_to_schedule().len());

        for stage in &stages {
            stage.scheduling_complete();
        }
        assert!(schedule.is_finished());
        assert!(schedule.stages_to_schedule().is_empty());
    }

    #[test]
    fn phased_walks_leaves_first() {
        let stages = stages(3);
        let mut schedule = PhasedPolicy.create_execution_schedule(stages.clone());

        let first = schedule.stages_to_schedule();
        assert_eq!(1, first.len());
        assert_eq!(2, first[0].stage_id().index);

        stages[2].scheduling_complete();
        let second = schedule.stages_to_schedule();
        assert_eq!(1, second[0].stage_id().index);

        for stage in &stages {
            stage.scheduling_complete();
        }
        assert!(schedule.is_finished());
    }

    #[test]
    fn canceled_stages_count_as_done_scheduling() {
        let stages = stages(2);
        let mut schedule = AllAtOncePolicy.create_execution_schedule(stages.clone());
        stages[0].cancel();
        stages[1].cancel();
        assert!(schedule.is_finished());
    }
}
