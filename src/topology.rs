//! Cluster topology types consumed by the acknowledgment collector.
//!
//! The key-to-owner hashing itself lives elsewhere; this module only models
//! its output: for every segment of the key space, an ordered owner list
//! whose first element is the primary owner.

use std::collections::{HashMap, HashSet};

/// Cluster member identity.
pub type NodeAddress = u32;

/// Version stamped on every ownership assignment; strictly increasing across
/// the cluster's lifetime.
pub type TopologyId = u32;

/// Partition of the key space used to group keys for ownership assignment.
pub type SegmentId = u32;

/// Snapshot of cluster membership plus segment ownership, activated as one
/// topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipView {
    /// Topology version of this view.
    topology_id: TopologyId,

    /// Current cluster members.
    members: HashSet<NodeAddress>,

    /// Map from segment -> owner list, primary first.
    owners: HashMap<SegmentId, Vec<NodeAddress>>,
}

impl OwnershipView {
    /// Creates a new view. Members are derived from the owner lists plus any
    /// extra non-owning `members` given.
    pub fn new(
        topology_id: TopologyId,
        members: impl IntoIterator<Item = NodeAddress>,
        owners: HashMap<SegmentId, Vec<NodeAddress>>,
    ) -> Self {
        let mut members: HashSet<NodeAddress> = members.into_iter().collect();
        members.extend(owners.values().flatten().copied());
        OwnershipView {
            topology_id,
            members,
            owners,
        }
    }

    /// Topology version of this view.
    #[inline]
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Is the node a member of the cluster in this view?
    #[inline]
    pub fn is_member(&self, node: NodeAddress) -> bool {
        self.members.contains(&node)
    }

    /// Current cluster members.
    pub fn members(&self) -> &HashSet<NodeAddress> {
        &self.members
    }

    /// Primary owner of a segment, `None` if the segment is unassigned.
    pub fn primary_of(&self, segment: SegmentId) -> Option<NodeAddress> {
        self.owners
            .get(&segment)
            .and_then(|owners| owners.first().copied())
    }

    /// Backup owners of a segment, i.e., all owners but the primary.
    pub fn backups_of(&self, segment: SegmentId) -> &[NodeAddress] {
        match self.owners.get(&segment) {
            Some(owners) if !owners.is_empty() => &owners[1..],
            _ => &[],
        }
    }

    /// Is the node still a live owner (primary or backup) of the segment?
    pub fn is_owner(&self, segment: SegmentId, node: NodeAddress) -> bool {
        self.is_member(node)
            && self
                .owners
                .get(&segment)
                .is_some_and(|owners| owners.contains(&node))
    }
}
