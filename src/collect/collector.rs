//! Per-operation acknowledgment state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::collect::{CompletionCell, OperationId, WriteError, WriteOutcome};
use crate::topology::{NodeAddress, SegmentId, TopologyId};

/// Owner-accounting shape of a collector. All protocol logic is shared; only
/// how the remaining owners are bookkept differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Owners {
    /// Single-key write: one flat set of backup owners for the key's segment.
    Single {
        segment: SegmentId,
        remaining: HashSet<NodeAddress>,
    },

    /// Multi-key write: backup owners vary per segment. Segments whose owner
    /// set drained are removed, so the map's length is the outstanding count.
    Segmented {
        remaining: HashMap<SegmentId, HashSet<NodeAddress>>,
    },
}

impl Owners {
    /// Builds the segmented shape, dropping segments with no backup owners.
    pub(crate) fn segmented(
        per_segment: HashMap<SegmentId, HashSet<NodeAddress>>,
    ) -> Self {
        Owners::Segmented {
            remaining: per_segment
                .into_iter()
                .filter(|(_, owners)| !owners.is_empty())
                .collect(),
        }
    }

    /// True if no owner is left to wait for.
    pub(crate) fn is_satisfied(&self) -> bool {
        match self {
            Owners::Single { remaining, .. } => remaining.is_empty(),
            Owners::Segmented { remaining } => remaining.is_empty(),
        }
    }

    /// Removes an owner's requirement, either from one segment or, if
    /// `segment` is `None`, from every segment. Returns true if anything
    /// changed.
    pub(crate) fn remove(
        &mut self,
        from: NodeAddress,
        segment: Option<SegmentId>,
    ) -> bool {
        match self {
            // a segment-scoped ack on a single-key write is a plain ack
            Owners::Single { remaining, .. } => remaining.remove(&from),

            Owners::Segmented { remaining } => match segment {
                Some(seg) => {
                    let Some(owners) = remaining.get_mut(&seg) else {
                        return false;
                    };
                    let removed = owners.remove(&from);
                    if owners.is_empty() {
                        remaining.remove(&seg);
                    }
                    removed
                }
                None => {
                    let mut removed = false;
                    remaining.retain(|_, owners| {
                        removed |= owners.remove(&from);
                        !owners.is_empty()
                    });
                    removed
                }
            },
        }
    }

    /// Number of (segment, owner) requirements still outstanding.
    pub(crate) fn outstanding(&self) -> usize {
        match self {
            Owners::Single { remaining, .. } => remaining.len(),
            Owners::Segmented { remaining } => {
                remaining.values().map(HashSet::len).sum()
            }
        }
    }
}

/// Result of feeding one event into a collector.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum Verdict {
    /// Event carried an older topology than the collector's; untouched.
    Stale { current: TopologyId },

    /// Accepted, but still waiting for more acks.
    Pending,

    /// Accepted, and the collector must now resolve with this outcome.
    Terminal(WriteOutcome),
}

/// In-flight write tracking which backup owners must still confirm.
#[derive(Debug)]
pub(crate) struct Collector {
    pub(crate) id: OperationId,

    /// Topology epoch the owner sets belong to; advanced by reconciliation.
    pub(crate) topology_id: TopologyId,

    pub(crate) owners: Owners,

    /// Shared with the caller's `CompletionHandle`s.
    pub(crate) cell: Arc<CompletionCell>,
}

impl Collector {
    pub(crate) fn new(
        id: OperationId,
        topology_id: TopologyId,
        owners: Owners,
    ) -> Self {
        Collector {
            id,
            topology_id,
            owners,
            cell: Arc::new(CompletionCell::default()),
        }
    }

    /// Handles a positive ack from a backup owner, optionally scoped to one
    /// segment.
    pub(crate) fn ack(
        &mut self,
        from: NodeAddress,
        topology_id: TopologyId,
        segment: Option<SegmentId>,
    ) -> Verdict {
        if topology_id < self.topology_id {
            return Verdict::Stale {
                current: self.topology_id,
            };
        }
        self.owners.remove(from, segment);
        if self.owners.is_satisfied() {
            Verdict::Terminal(Ok(()))
        } else {
            Verdict::Pending
        }
    }

    /// Handles an error reply; fails fast regardless of remaining owners.
    pub(crate) fn error(
        &mut self,
        from: NodeAddress,
        topology_id: TopologyId,
        cause: String,
    ) -> Verdict {
        if topology_id < self.topology_id {
            return Verdict::Stale {
                current: self.topology_id,
            };
        }
        Verdict::Terminal(Err(WriteError::Remote { from, cause }))
    }

    /// Attempts the single terminal transition. Returns true iff this call
    /// resolved the completion handle.
    #[inline]
    pub(crate) fn complete(&self, outcome: WriteOutcome) -> bool {
        self.cell.try_complete(outcome)
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.cell.is_done()
    }
}
