//! Operation identifiers correlating a forwarded write with its acks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::topology::NodeAddress;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Identifier of an in-flight write, unique per (originating node, local
/// sequence number).
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct OperationId {
    /// Node that issued the write.
    pub origin: NodeAddress,

    /// Sequence number local to the origin.
    pub seq: u64,
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// Wait-free allocator of monotonically increasing operation IDs for one
/// originating node.
#[derive(Debug)]
pub struct OperationIdAllocator {
    origin: NodeAddress,
    next_seq: AtomicU64,
}

impl OperationIdAllocator {
    /// Creates a new allocator for given origin node.
    pub fn new(origin: NodeAddress) -> Self {
        OperationIdAllocator {
            origin,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Origin node stamped on every issued ID.
    #[inline]
    pub fn origin(&self) -> NodeAddress {
        self.origin
    }

    /// Issues the next ID. Never returns a value previously returned by this
    /// allocator.
    #[inline]
    pub fn next_id(&self) -> OperationId {
        OperationId {
            origin: self.origin,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}
