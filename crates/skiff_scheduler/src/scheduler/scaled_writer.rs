//! Scheduler for scaled writer stages.
//!
//! Starts a single writer task and adds more one at a time while the source
//! stages produce data faster than the current writers drain it. Growth
//! requires both at least `writer_min_size_bytes` of data buffered in the
//! source stages' output buffers per existing writer and every existing
//! writer to have written at least `writer_min_size_bytes`, which keeps
//! small writes from fanning out into many tiny output files.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use skiff_error::{DbError, ErrorCode, Result};
use tracing::debug;

use crate::node::NodeSelector;
use crate::scheduler::result::{BlockedReason, ScheduleResult};
use crate::stage::StageExecution;
use crate::task::TaskStatus;

pub type SourceStatusProvider = Arc<dyn Fn() -> Vec<TaskStatus> + Send + Sync>;

pub struct ScaledWriterScheduler {
    stage: Arc<StageExecution>,
    source_task_statuses: SourceStatusProvider,
    node_selector: Arc<dyn NodeSelector>,
    writer_min_size_bytes: u64,
    max_writer_tasks: usize,
    /// Set once every source stage completes; no further writers are needed
    /// after that even if data is still buffered.
    finish: Arc<AtomicBool>,
    scheduled: usize,
    blocked_retry_wait: Duration,
}

impl ScaledWriterScheduler {
    pub fn new(
        stage: Arc<StageExecution>,
        source_task_statuses: SourceStatusProvider,
        node_selector: Arc<dyn NodeSelector>,
        writer_min_size_bytes: u64,
        max_writer_tasks: usize,
        blocked_retry_wait: Duration,
    ) -> Self {
        ScaledWriterScheduler {
            stage,
            source_task_statuses,
            node_selector,
            writer_min_size_bytes,
            max_writer_tasks,
            finish: Arc::new(AtomicBool::new(false)),
            scheduled: 0,
            blocked_retry_wait,
        }
    }

    /// Flag that completes this scheduler once all source stages are done.
    pub fn finish_flag(&self) -> Arc<AtomicBool> {
        self.finish.clone()
    }

    pub fn schedule(&mut self) -> Result<ScheduleResult> {
        // Checked before scheduling the first writer: a query whose sources
        // finish without producing data still completes with zero writers.
        if self.finish.load(Ordering::SeqCst) {
            return Ok(ScheduleResult::non_blocked(true, Vec::new(), 0));
        }

        let want_writer = if self.scheduled == 0 {
            true
        } else if self.scheduled >= self.max_writer_tasks {
            false
        } else {
            let buffered: u64 = (self.source_task_statuses)()
                .iter()
                .map(|s| s.output_buffered_bytes)
                .sum();
            buffered >= self.writer_min_size_bytes * self.scheduled as u64
                && self.writers_past_min_size()
        };

        let mut new_tasks = Vec::new();
        if want_writer {
            let nodes = self.node_selector.all_nodes();
            if nodes.is_empty() {
                return Err(DbError::new("No worker nodes available")
                    .with_code(ErrorCode::NoNodesAvailable));
            }
            let node = &nodes[self.scheduled % nodes.len()];
            let task = self.stage.schedule_task(node, self.scheduled as u32)?;
            debug!(stage_id = %self.stage.stage_id(), writers = self.scheduled + 1, "added writer task");
            new_tasks.push(task);
            self.scheduled += 1;
        }

        let wait = tokio::time::sleep(self.blocked_retry_wait).boxed();
        Ok(ScheduleResult::blocked(
            new_tasks,
            0,
            wait,
            BlockedReason::WriterScaling,
        ))
    }

    /// Every existing writer must have written the minimum before another is
    /// added; a backlog alone says nothing about writer throughput.
    fn writers_past_min_size(&self) -> bool {
        self.stage
            .task_statuses()
            .iter()
            .all(|status| status.bytes_processed >= self.writer_min_size_bytes)
    }
}

impl std::fmt::Debug for ScaledWriterScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaledWriterScheduler")
            .field("stage_id", &self.stage.stage_id())
            .field("scheduled", &self.scheduled)
            .field("max_writer_tasks", &self.max_writer_tasks)
            .field("finish", &self.finish.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
