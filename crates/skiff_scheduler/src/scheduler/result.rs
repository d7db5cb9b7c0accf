//! Result of one scheduler tick.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::task::RemoteTask;

/// Why a scheduler tick could make no further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    /// Writer scaling is waiting for throughput data before adding writers.
    WriterScaling,
    WaitingForSource,
    SplitQueuesFull,
    MixedSplitQueuesFullAndWaitingForSource,
    /// Grouped execution has assigned every active group and is waiting for
    /// one to finish.
    NoActiveExecutionGroup,
}

impl BlockedReason {
    /// Combine the reasons of two blocked sub-steps into one reason for the
    /// whole tick.
    pub fn combine(self, other: BlockedReason) -> BlockedReason {
        use BlockedReason::*;
        match (self, other) {
            // Writer scaling blocks the whole stage regardless of what else
            // is pending.
            (WriterScaling, _) => WriterScaling,
            (a, b) if a == b => a,
            (NoActiveExecutionGroup, b) => b,
            (a, NoActiveExecutionGroup) => a,
            _ => MixedSplitQueuesFullAndWaitingForSource,
        }
    }
}

/// Outcome of a single call to a stage scheduler.
pub struct ScheduleResult {
    finished: bool,
    new_tasks: Vec<Arc<dyn RemoteTask>>,
    splits_scheduled: usize,
    blocked: Option<BoxFuture<'static, ()>>,
    blocked_reason: Option<BlockedReason>,
}

impl ScheduleResult {
    pub fn non_blocked(
        finished: bool,
        new_tasks: Vec<Arc<dyn RemoteTask>>,
        splits_scheduled: usize,
    ) -> Self {
        ScheduleResult {
            finished,
            new_tasks,
            splits_scheduled,
            blocked: None,
            blocked_reason: None,
        }
    }

    pub fn blocked(
        new_tasks: Vec<Arc<dyn RemoteTask>>,
        splits_scheduled: usize,
        blocked: BoxFuture<'static, ()>,
        reason: BlockedReason,
    ) -> Self {
        ScheduleResult {
            finished: false,
            new_tasks,
            splits_scheduled,
            blocked: Some(blocked),
            blocked_reason: Some(reason),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn new_tasks(&self) -> &[Arc<dyn RemoteTask>] {
        &self.new_tasks
    }

    pub fn splits_scheduled(&self) -> usize {
        self.splits_scheduled
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        self.blocked_reason
    }

    /// Take the blocked future, if any, leaving the rest of the result
    /// intact.
    pub fn take_blocked(&mut self) -> Option<BoxFuture<'static, ()>> {
        self.blocked.take()
    }
}

impl fmt::Debug for ScheduleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleResult")
            .field("finished", &self.finished)
            .field("new_tasks", &self.new_tasks.len())
            .field("splits_scheduled", &self.splits_scheduled)
            .field("blocked", &self.blocked.is_some())
            .field("blocked_reason", &self.blocked_reason)
            .finish()
    }
}
