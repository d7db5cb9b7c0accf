//! Query-level state.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use skiff_error::DbError;
use tracing::debug;
use url::Url;

use crate::plan::QueryId;
use crate::stage::StageInfo;
use crate::util::Subscribers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryState {
    Queued,
    Starting,
    Running,
    /// All results produced, output buffers draining.
    Finishing,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub const fn is_done(&self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Failed | QueryState::Canceled
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryState::Queued => "QUEUED",
            QueryState::Starting => "STARTING",
            QueryState::Running => "RUNNING",
            QueryState::Finishing => "FINISHING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
            QueryState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

struct QueryInner {
    state: QueryState,
    failure_cause: Option<DbError>,
    output_locations: Vec<Url>,
    no_more_output_locations: bool,
    stage_info: Option<StageInfo>,
}

/// Tracks a query through its lifecycle and fans state changes out to
/// subscribers.
///
/// Transitions are monotonic; once a terminal state is reached all further
/// transitions are ignored.
pub struct QueryStateMachine {
    query_id: QueryId,
    inner: Mutex<QueryInner>,
    subscribers: Subscribers<QueryState>,
}

impl QueryStateMachine {
    /// Queries enter the scheduler already admitted, so they start out in
    /// Starting rather than Queued.
    pub fn new(query_id: QueryId) -> Self {
        QueryStateMachine {
            query_id,
            inner: Mutex::new(QueryInner {
                state: QueryState::Starting,
                failure_cause: None,
                output_locations: Vec::new(),
                no_more_output_locations: false,
                stage_info: None,
            }),
            subscribers: Subscribers::new(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().state
    }

    pub fn failure_cause(&self) -> Option<DbError> {
        self.inner.lock().failure_cause.clone()
    }

    pub fn subscribe_state_changes<F>(&self, f: F)
    where
        F: Fn(QueryState) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(f);
    }

    pub fn transition_to_running(&self) {
        self.transition(|state| matches!(state, QueryState::Starting), QueryState::Running);
    }

    pub fn transition_to_finishing(&self) {
        self.transition(
            |state| matches!(state, QueryState::Starting | QueryState::Running),
            QueryState::Finishing,
        );
    }

    pub fn transition_to_finished(&self) {
        self.transition(|state| matches!(state, QueryState::Finishing), QueryState::Finished);
    }

    pub fn transition_to_canceled(&self) {
        self.transition(|state| !state.is_done(), QueryState::Canceled);
    }

    /// Fail the query. The first cause wins.
    pub fn transition_to_failed(&self, cause: DbError) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                false
            } else {
                if inner.failure_cause.is_none() {
                    inner.failure_cause = Some(cause);
                }
                inner.state = QueryState::Failed;
                true
            }
        };
        if changed {
            debug!(query_id = %self.query_id, state = %QueryState::Failed, "query state change");
            self.subscribers.notify(QueryState::Failed);
        }
    }

    fn transition<F>(&self, allowed: F, target: QueryState)
    where
        F: FnOnce(QueryState) -> bool,
    {
        let changed = {
            let mut inner = self.inner.lock();
            if allowed(inner.state) {
                inner.state = target;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(query_id = %self.query_id, state = %target, "query state change");
            self.subscribers.notify(target);
        }
    }

    /// Record where clients can fetch query results from.
    pub fn update_output_locations(&self, locations: Vec<Url>, no_more: bool) {
        let mut inner = self.inner.lock();
        inner.output_locations.extend(locations);
        inner.no_more_output_locations |= no_more;
    }

    pub fn output_locations(&self) -> (Vec<Url>, bool) {
        let inner = self.inner.lock();
        (inner.output_locations.clone(), inner.no_more_output_locations)
    }

    pub fn set_stage_info(&self, info: StageInfo) {
        self.inner.lock().stage_info = Some(info);
    }

    pub fn latest_stage_info(&self) -> Option<StageInfo> {
        self.inner.lock().stage_info.clone()
    }
}

impl fmt::Debug for QueryStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStateMachine")
            .field("query_id", &self.query_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
