//! Public entry point used by the write-command execution path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::collect::{
    AckMsg, CollectorRegistry, CompletionHandle, OperationId,
    TimeoutSupervisor, TopologyReconciler, WriteError, MAX_WRITE_TIMEOUT,
};
use crate::topology::{NodeAddress, OwnershipView, SegmentId, TopologyId};
use crate::utils::AckgridError;

use serde::Deserialize;

use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckCollectorConfig {
    /// Per-write deadline in millisecs, normally the cache's remote-call
    /// timeout.
    pub remote_timeout_ms: u64,

    /// Maximum number of outstanding writes. 0 means unlimited.
    pub max_pending: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for AckCollectorConfig {
    fn default() -> Self {
        AckCollectorConfig {
            remote_timeout_ms: 15000,
            max_pending: 0,
        }
    }
}

/// Backup acknowledgment collector of one cache instance. Created at cache
/// start and torn down by `stop()` at cache stop.
///
/// Typical write path on the primary owner:
/// ```no_compile
/// let (id, handle) = acks.create(backups, segment, topology_id);
/// forward_to_backups(id, topology_id, cmd);
/// handle.wait().await?;
/// ```
/// while the transport feeds replies in through `handle_msg()`.
#[derive(Debug)]
pub struct AckCollector {
    config: AckCollectorConfig,

    registry: Arc<CollectorRegistry>,

    reconciler: TopologyReconciler,

    supervisor: TimeoutSupervisor,
}

impl AckCollector {
    /// Creates the collector for primary node `local`, starting at topology
    /// `initial_topology`, with config overrides parsed from `config_str`.
    /// Must be called within the context of a tokio runtime.
    pub fn new_and_setup(
        local: NodeAddress,
        initial_topology: TopologyId,
        config_str: Option<&str>,
    ) -> Result<Self, AckgridError> {
        let config = parsed_config!(config_str => AckCollectorConfig;
                                    remote_timeout_ms, max_pending)?;
        if config.remote_timeout_ms == 0 {
            return logged_err!(
                "invalid config.remote_timeout_ms '{}'",
                config.remote_timeout_ms
            );
        }

        let registry = Arc::new(CollectorRegistry::new(local, config.max_pending));
        let reconciler = TopologyReconciler::new(local, initial_topology);
        let supervisor = TimeoutSupervisor::new_and_setup(registry.clone());

        pf_info!(
            "ack collector ready @ {} timeout {} ms",
            initial_topology,
            config.remote_timeout_ms
        );
        Ok(AckCollector {
            config,
            registry,
            reconciler,
            supervisor,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &AckCollectorConfig {
        &self.config
    }

    /// Underlying registry, for inspection.
    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// Registers a single-key write on `segment` before forwarding it to
    /// `owners`, with the configured deadline.
    pub fn create(
        &self,
        owners: HashSet<NodeAddress>,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> (OperationId, CompletionHandle) {
        self.create_with_timeout(
            owners,
            segment,
            topology_id,
            Duration::from_millis(self.config.remote_timeout_ms),
        )
    }

    /// Same as `create()`, with a per-write deadline. Deadlines longer than
    /// `MAX_WRITE_TIMEOUT` are clamped to it.
    pub fn create_with_timeout(
        &self,
        owners: HashSet<NodeAddress>,
        segment: SegmentId,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> (OperationId, CompletionHandle) {
        let timeout = if timeout > MAX_WRITE_TIMEOUT {
            pf_warn!(
                "clamping write timeout {:?} to {:?}",
                timeout,
                MAX_WRITE_TIMEOUT
            );
            MAX_WRITE_TIMEOUT
        } else {
            timeout
        };

        let (id, handle) = self.registry.create(owners, segment, topology_id);
        self.reconciler.catch_up(&self.registry, id, topology_id);
        self.arm_deadline(&handle, timeout);
        (id, handle)
    }

    /// Registers a multi-key write before forwarding it to per-segment
    /// owners, with the configured deadline.
    pub fn create_segmented(
        &self,
        per_segment: HashMap<SegmentId, HashSet<NodeAddress>>,
        topology_id: TopologyId,
    ) -> (OperationId, CompletionHandle) {
        let (id, handle) =
            self.registry.create_segmented(per_segment, topology_id);
        self.reconciler.catch_up(&self.registry, id, topology_id);
        self.arm_deadline(
            &handle,
            Duration::from_millis(self.config.remote_timeout_ms),
        );
        (id, handle)
    }

    /// Schedules expiry for a freshly created handle, if it is pending.
    fn arm_deadline(&self, handle: &CompletionHandle, timeout: Duration) {
        if handle.is_done() {
            return;
        }
        if let Err(e) = self.supervisor.schedule(handle.id(), timeout) {
            pf_error!("failed to schedule deadline of {}: {}", handle.id(), e);
            self.registry.finish(handle.id(), Err(WriteError::Stopping));
        }
    }

    /// Feeds a decoded reply from backup `from`.
    pub fn handle_msg(&self, from: NodeAddress, msg: AckMsg) {
        msg.dispatch(from, &self.registry);
    }

    /// Decodes and feeds a raw reply from backup `from`. Undecodable bytes
    /// are logged and dropped.
    pub fn handle_bytes(&self, from: NodeAddress, buf: &[u8]) {
        match AckMsg::decode(buf) {
            Ok(msg) => self.handle_msg(from, msg),
            Err(e) => pf_warn!("dropping undecodable reply from {}: {}", from, e),
        }
    }

    /// Handles a backup owner's positive ack.
    pub fn ack(&self, id: OperationId, from: NodeAddress, topology_id: TopologyId) {
        self.registry.ack(id, from, topology_id);
    }

    /// Handles a backup owner's ack scoped to one segment.
    pub fn segment_ack(
        &self,
        id: OperationId,
        from: NodeAddress,
        topology_id: TopologyId,
        segment: SegmentId,
    ) {
        self.registry.segment_ack(id, from, topology_id, segment);
    }

    /// Handles a backup owner's failure report.
    pub fn error(
        &self,
        id: OperationId,
        from: NodeAddress,
        topology_id: TopologyId,
        cause: String,
    ) {
        self.registry.error(id, from, topology_id, cause);
    }

    /// Fails a write because applying it locally failed after forwarding.
    pub fn complete_exceptionally(
        &self,
        id: OperationId,
        topology_id: TopologyId,
        cause: String,
    ) {
        self.registry
            .error(id, self.registry.local(), topology_id, cause);
    }

    /// Reconciles outstanding writes against a newly activated topology.
    pub fn on_topology_changed(&self, view: &OwnershipView) -> usize {
        self.reconciler.on_topology_changed(&self.registry, view)
    }

    /// Drops requirements on backups that left the cluster.
    pub fn on_members_changed(&self, members: &HashSet<NodeAddress>) -> usize {
        self.reconciler.on_members_changed(&self.registry, members)
    }

    /// Highest topology applied so far.
    pub fn active_topology(&self) -> TopologyId {
        self.reconciler.active_topology()
    }

    /// Fails every outstanding write with `WriteError::Stopping` and stops
    /// the deadline sweeper. Returns the number of writes cancelled.
    pub fn stop(&self) -> usize {
        let cancelled = self.registry.stop();
        self.supervisor.stop();
        pf_info!("ack collector stopped, {} writes cancelled", cancelled);
        cancelled
    }
}
