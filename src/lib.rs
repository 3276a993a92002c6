//! Ackgrid: backup acknowledgment collection for a replicated in-memory data
//! grid.
//!
//! A primary owner applies a write locally, forwards it to the key's backup
//! owners, and registers the write here. Replies from backups, topology
//! changes, and deadlines then race to resolve the write's completion handle
//! exactly once.

#[macro_use]
mod utils;

mod collect;
mod topology;

pub use utils::{logger_init, AckgridError, ME};

pub use topology::{NodeAddress, OwnershipView, SegmentId, TopologyId};

pub use collect::{
    AckCollector, AckCollectorConfig, AckMsg, CollectorRegistry,
    CompletionHandle, OperationId, OperationIdAllocator, TimeoutSupervisor,
    TopologyReconciler, WriteError, WriteOutcome, MAX_WRITE_TIMEOUT,
};
