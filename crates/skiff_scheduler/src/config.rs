use std::time::Duration;

/// Behavior knobs for query scheduling.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max splits fetched from a split source in one batch.
    pub split_batch_size: usize,
    /// Max splits queued on a single node across all of a stage's tasks.
    pub max_splits_per_node: usize,
    /// Max splits assigned to one node in a single placement round.
    pub max_pending_splits_per_task: usize,
    /// Minimum data a writer task should receive before another writer is
    /// added by the scaled-writer scheduler. Must be non-zero.
    pub writer_min_size_bytes: u64,
    /// Hard cap on writer tasks created by the scaled-writer scheduler.
    pub max_writer_tasks: usize,
    /// Max execution groups concurrently active per node under grouped
    /// execution.
    pub concurrent_groups_per_node: usize,
    /// Upper bound on how long one scheduling iteration waits for a blocked
    /// stage to unblock before re-evaluating everything.
    pub loop_wait: Duration,
    /// How long a scheduler sleeps before retrying when it is blocked on a
    /// condition without a dedicated wake-up (queue drain, writer scaling).
    pub blocked_retry_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            split_batch_size: 1000,
            max_splits_per_node: 100,
            max_pending_splits_per_task: 10,
            writer_min_size_bytes: 32 * 1024 * 1024,
            max_writer_tasks: 100,
            concurrent_groups_per_node: 1,
            loop_wait: Duration::from_secs(1),
            blocked_retry_wait: Duration::from_millis(200),
        }
    }
}
