//! Concurrent registry of in-flight collectors, keyed by operation ID.
//!
//! This is the only mutation surface reachable from reply-handling threads.
//! Every entry point is non-blocking with respect to other operations' state
//! and never fails: unknown, stale, or duplicate events are logged and
//! dropped.
//!
//! Terminal transitions are decided under the entry's map lock through the
//! collector's single-resolution cell; the winner then removes the entry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::collect::{
    Collector, CompletionHandle, OperationId, OperationIdAllocator, Owners,
    Verdict, WriteError, WriteOutcome,
};
use crate::topology::{NodeAddress, SegmentId, TopologyId};

use dashmap::DashMap;

/// Registry of outstanding collectors of one cache instance.
#[derive(Debug)]
pub struct CollectorRegistry {
    /// ID allocator for operations originating at this node.
    ids: OperationIdAllocator,

    /// Map from operation ID -> its collector.
    collectors: DashMap<OperationId, Collector>,

    /// Maximum number of outstanding collectors; 0 means unlimited.
    max_pending: usize,

    /// Set once by `stop()`; no collector is admitted afterwards.
    stopped: AtomicBool,
}

impl CollectorRegistry {
    /// Creates an empty registry for the node at `local`.
    pub fn new(local: NodeAddress, max_pending: usize) -> Self {
        CollectorRegistry {
            ids: OperationIdAllocator::new(local),
            collectors: DashMap::new(),
            max_pending,
            stopped: AtomicBool::new(false),
        }
    }

    /// Address of the node owning this registry.
    #[inline]
    pub fn local(&self) -> NodeAddress {
        self.ids.origin()
    }

    /// Registers a single-key write whose key maps to `segment`, waiting on
    /// `owners` as backups. An empty owner set yields an already-succeeded
    /// handle.
    pub fn create(
        &self,
        owners: HashSet<NodeAddress>,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> (OperationId, CompletionHandle) {
        self.admit(
            topology_id,
            Owners::Single {
                segment,
                remaining: owners,
            },
        )
    }

    /// Registers a multi-key write whose backup owners vary per segment.
    /// Segments without backups count as satisfied from the start.
    pub fn create_segmented(
        &self,
        per_segment: HashMap<SegmentId, HashSet<NodeAddress>>,
        topology_id: TopologyId,
    ) -> (OperationId, CompletionHandle) {
        self.admit(topology_id, Owners::segmented(per_segment))
    }

    /// Builds a collector and inserts it, unless it needs no waiting at all.
    fn admit(
        &self,
        topology_id: TopologyId,
        owners: Owners,
    ) -> (OperationId, CompletionHandle) {
        let id = self.ids.next_id();

        if self.stopped.load(Ordering::Acquire) {
            pf_debug!("rejecting write {}: registry stopped", id);
            return (id, CompletionHandle::resolved(id, Err(WriteError::Stopping)));
        }
        if owners.is_satisfied() {
            pf_trace!("write {} has no backups to wait for", id);
            return (id, CompletionHandle::resolved(id, Ok(())));
        }
        if self.max_pending > 0 {
            let pending = self.collectors.len();
            if pending >= self.max_pending {
                pf_warn!("rejecting write {}: {} pending", id, pending);
                return (
                    id,
                    CompletionHandle::resolved(
                        id,
                        Err(WriteError::Overloaded { pending }),
                    ),
                );
            }
        }

        let collector = Collector::new(id, topology_id, owners);
        let handle = CompletionHandle::new(id, collector.cell.clone());
        pf_trace!(
            "created collector {} @ {} waiting on {:?}",
            id,
            topology_id,
            collector.owners
        );
        self.collectors.insert(id, collector);

        // `stop()` may have drained the map between the check and the insert
        if self.stopped.load(Ordering::Acquire) {
            self.finish(id, Err(WriteError::Stopping));
        }
        (id, handle)
    }

    /// Feeds one event into the collector of `id` under its entry lock, and
    /// removes the entry if the event decided the outcome. Returns true iff
    /// this call resolved the handle.
    pub(crate) fn apply<F>(&self, id: OperationId, what: &str, event: F) -> bool
    where
        F: FnOnce(&mut Collector) -> Verdict,
    {
        let won = {
            let Some(mut collector) = self.collectors.get_mut(&id) else {
                pf_trace!("ignoring {} for {}: unknown or finished", what, id);
                return false;
            };
            if collector.is_done() {
                pf_trace!("ignoring {} for {}: already terminal", what, id);
                return false;
            }
            match event(collector.value_mut()) {
                Verdict::Stale { current } => {
                    pf_debug!(
                        "ignoring stale {} for {}: collector @ {}",
                        what,
                        id,
                        current
                    );
                    false
                }
                Verdict::Pending => false,
                Verdict::Terminal(outcome) => {
                    pf_trace!("{} completes {}: {:?}", what, id, outcome);
                    collector.complete(outcome)
                }
            }
        }; // entry guard dropped here before touching the map again

        if won {
            self.remove(id);
        }
        won
    }

    /// Handles a backup owner's positive ack.
    pub fn ack(&self, id: OperationId, from: NodeAddress, topology_id: TopologyId) {
        self.apply(id, "ack", |c| c.ack(from, topology_id, None));
    }

    /// Handles a backup owner's ack scoped to one segment.
    pub fn segment_ack(
        &self,
        id: OperationId,
        from: NodeAddress,
        topology_id: TopologyId,
        segment: SegmentId,
    ) {
        self.apply(id, "segment ack", |c| {
            c.ack(from, topology_id, Some(segment))
        });
    }

    /// Handles a backup owner's failure report. Fails the write immediately.
    pub fn error(
        &self,
        id: OperationId,
        from: NodeAddress,
        topology_id: TopologyId,
        cause: String,
    ) {
        if self.apply(id, "error", |c| c.error(from, topology_id, cause)) {
            pf_debug!("write {} failed remotely at {}", id, from);
        }
    }

    /// Forces the collector of `id` into a terminal outcome if still pending.
    /// Returns true iff this call resolved it.
    pub(crate) fn finish(&self, id: OperationId, outcome: WriteOutcome) -> bool {
        self.apply(id, "forced completion", |_| Verdict::Terminal(outcome))
    }

    /// Drops the entry of a collector that has reached its terminal state.
    fn remove(&self, id: OperationId) -> bool {
        self.collectors.remove(&id).is_some()
    }

    /// Walks every outstanding collector with `f`, resolving and removing
    /// those `f` decides. `f` must not call back into the registry. Returns
    /// the number of collectors resolved.
    pub(crate) fn sweep<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&mut Collector) -> Verdict,
    {
        let mut finished = Vec::new();
        for mut entry in self.collectors.iter_mut() {
            let collector = entry.value_mut();
            if collector.is_done() {
                continue;
            }
            if let Verdict::Terminal(outcome) = f(collector) {
                if collector.complete(outcome) {
                    finished.push(collector.id);
                }
            }
        }
        for &id in &finished {
            self.remove(id);
        }
        finished.len()
    }

    /// Fails every outstanding collector with `WriteError::Stopping` and
    /// clears the registry. Later creations resolve as stopping immediately.
    /// Returns the number of collectors cancelled.
    pub fn stop(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let mut cancelled = 0;
        self.collectors.retain(|_, collector| {
            if collector.complete(Err(WriteError::Stopping)) {
                cancelled += 1;
            }
            false
        });
        cancelled
    }

    /// Has `stop()` been called?
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// IDs of collectors still pending.
    pub fn pending_ids(&self) -> Vec<OperationId> {
        self.collectors
            .iter()
            .filter(|entry| !entry.value().is_done())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Is the write with given ID still waiting for backup acks?
    pub fn has_pending(&self, id: OperationId) -> bool {
        self.collectors
            .get(&id)
            .is_some_and(|collector| !collector.is_done())
    }

    /// Number of outstanding (segment, owner) requirements of a pending
    /// write, `None` if not pending.
    pub fn outstanding(&self, id: OperationId) -> Option<usize> {
        self.collectors
            .get(&id)
            .filter(|collector| !collector.is_done())
            .map(|collector| collector.owners.outstanding())
    }

    /// Number of registered collectors.
    #[inline]
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
