//! Backup acknowledgment collection: registry of in-flight replicated writes
//! and the machinery that drives them to exactly one terminal outcome.

mod collector;
mod facade;
mod messages;
mod opid;
mod outcome;
mod reconcile;
mod registry;
mod timeout;

pub use facade::{AckCollector, AckCollectorConfig};
pub use messages::AckMsg;
pub use opid::{OperationId, OperationIdAllocator};
pub use outcome::{CompletionHandle, WriteError, WriteOutcome};
pub use reconcile::TopologyReconciler;
pub use registry::CollectorRegistry;
pub use timeout::{TimeoutSupervisor, MAX_WRITE_TIMEOUT};

pub(crate) use collector::{Collector, Owners, Verdict};
pub(crate) use outcome::CompletionCell;
