//! Splits and split sources.
//!
//! Split enumeration is a connector concern; the scheduler only consumes the
//! [`SplitSource`] seam: bounded batch fetches that either complete
//! immediately or hand back a future to wait on.

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use skiff_error::Result;

/// A unit of input data assigned to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub id: u64,
    /// The bucket this split belongs to under bucketed execution. `None` for
    /// unbucketed splits.
    pub bucket: Option<u32>,
}

impl Split {
    pub fn new(id: u64) -> Self {
        Split { id, bucket: None }
    }

    pub fn bucketed(id: u64, bucket: u32) -> Self {
        Split {
            id,
            bucket: Some(bucket),
        }
    }
}

/// One batch of splits returned from a source.
#[derive(Debug, Default)]
pub struct SplitBatch {
    pub splits: Vec<Split>,
    /// True once the source is exhausted; no further batches will follow.
    pub no_more_splits: bool,
}

/// Outcome of a non-blocking batch fetch.
pub enum SplitFetch {
    /// A batch was available without waiting.
    Ready(SplitBatch),
    /// No batch is available yet. The future resolves when another fetch may
    /// succeed; dropping it cancels the wait.
    Pending(BoxFuture<'static, ()>),
}

impl fmt::Debug for SplitFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitFetch::Ready(batch) => f.debug_tuple("Ready").field(batch).finish(),
            SplitFetch::Pending(_) => f.debug_tuple("Pending").finish(),
        }
    }
}

/// Connector-provided enumeration of a scan's splits.
pub trait SplitSource: fmt::Debug + Send {
    /// Catalog this source belongs to, used for catalog-aware node selection.
    fn catalog(&self) -> Option<&str> {
        None
    }

    /// Fetch up to `max_size` splits without blocking.
    fn fetch_next_batch(&mut self, max_size: usize) -> Result<SplitFetch>;

    /// True once every split has been handed out.
    fn is_finished(&self) -> bool;

    /// Release any outstanding fetches and connector resources. Must be safe
    /// to call more than once and after a failure.
    fn close(&mut self) {}
}
