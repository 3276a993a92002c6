//! Write outcome taxonomy and the caller-visible completion handle.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::collect::OperationId;
use crate::topology::{NodeAddress, TopologyId};

use tokio::sync::Notify;

/// Reasons a replicated write did not collect all its backup acks.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum WriteError {
    /// A backup owner failed to apply the write; `cause` is its report.
    Remote { from: NodeAddress, cause: String },

    /// No terminal outcome within the deadline.
    Timeout { after_ms: u64 },

    /// Ownership moved away from this primary; recompute owners and reissue.
    TopologyChanged { topology: TopologyId },

    /// The collector was torn down before the write finished.
    Stopping,

    /// Too many writes outstanding to admit another one.
    Overloaded { pending: usize },
}

impl WriteError {
    /// Whether the caller may reissue the write as a fresh operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WriteError::Timeout { .. }
                | WriteError::TopologyChanged { .. }
                | WriteError::Overloaded { .. }
        )
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WriteError::Remote { from, cause } => {
                write!(f, "backup {} failed: {}", from, cause)
            }
            WriteError::Timeout { after_ms } => {
                write!(f, "timed out waiting for backup acks after {} ms", after_ms)
            }
            WriteError::TopologyChanged { topology } => {
                write!(f, "ownership changed in topology {}", topology)
            }
            WriteError::Stopping => write!(f, "ack collector is stopping"),
            WriteError::Overloaded { pending } => {
                write!(f, "too many pending writes ({})", pending)
            }
        }
    }
}

impl std::error::Error for WriteError {}

/// Terminal outcome of one write.
pub type WriteOutcome = Result<(), WriteError>;

/// Single-resolution cell shared between a collector and its handles. The
/// first `try_complete()` wins; all later ones are discarded.
#[derive(Debug, Default)]
pub(crate) struct CompletionCell {
    outcome: OnceLock<WriteOutcome>,
    notify: Notify,
}

impl CompletionCell {
    /// Attempts the terminal transition. Returns true iff this call won.
    pub(crate) fn try_complete(&self, outcome: WriteOutcome) -> bool {
        if self.outcome.set(outcome).is_ok() {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// Caller-side handle of an in-flight write. Cheap to clone; every clone
/// observes the same single outcome.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    id: OperationId,
    cell: Arc<CompletionCell>,
}

impl CompletionHandle {
    pub(crate) fn new(id: OperationId, cell: Arc<CompletionCell>) -> Self {
        CompletionHandle { id, cell }
    }

    /// Creates a handle that is already resolved with given outcome.
    pub(crate) fn resolved(id: OperationId, outcome: WriteOutcome) -> Self {
        let cell = Arc::new(CompletionCell::default());
        cell.try_complete(outcome);
        CompletionHandle { id, cell }
    }

    /// ID of the tracked operation.
    #[inline]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Has the write reached a terminal outcome?
    #[inline]
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Terminal outcome if reached, `None` while pending.
    pub fn result(&self) -> Option<WriteOutcome> {
        self.cell.outcome.get().cloned()
    }

    /// Waits for the terminal outcome.
    pub async fn wait(&self) -> WriteOutcome {
        loop {
            // register interest before checking so a concurrent resolution
            // cannot slip in between
            let notified = self.cell.notify.notified();
            if let Some(outcome) = self.cell.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}
