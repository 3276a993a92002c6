//! Backup-to-primary acknowledgment messages.

use crate::collect::{CollectorRegistry, OperationId};
use crate::topology::{NodeAddress, SegmentId, TopologyId};
use crate::utils::AckgridError;

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Reply sent by a backup owner after handling a forwarded write. The sender
/// address is supplied by the transport, not carried in the message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum AckMsg {
    /// Write applied.
    Ack {
        op: OperationId,
        topology: TopologyId,
    },

    /// Write applied for the keys of one segment.
    SegmentAck {
        op: OperationId,
        topology: TopologyId,
        segment: SegmentId,
    },

    /// Write failed at the backup.
    ErrorAck {
        op: OperationId,
        topology: TopologyId,
        cause: String,
    },
}

impl AckMsg {
    /// Operation the message refers to.
    pub fn op(&self) -> OperationId {
        match self {
            AckMsg::Ack { op, .. }
            | AckMsg::SegmentAck { op, .. }
            | AckMsg::ErrorAck { op, .. } => *op,
        }
    }

    /// Encodes the message into MessagePack bytes.
    pub fn encode(&self) -> Result<Bytes, AckgridError> {
        Ok(Bytes::from(encode_to_vec(self)?))
    }

    /// Decodes a message from MessagePack bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, AckgridError> {
        Ok(decode_from_slice(buf)?)
    }

    /// Feeds the message from backup `from` into the registry.
    pub fn dispatch(self, from: NodeAddress, registry: &CollectorRegistry) {
        match self {
            AckMsg::Ack { op, topology } => registry.ack(op, from, topology),
            AckMsg::SegmentAck {
                op,
                topology,
                segment,
            } => registry.segment_ack(op, from, topology, segment),
            AckMsg::ErrorAck {
                op,
                topology,
                cause,
            } => registry.error(op, from, topology, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::WriteError;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn decode_garbage() {
        assert!(AckMsg::decode(&[0xc1, 0x00, 0xff]).is_err());
        assert!(AckMsg::decode(&[]).is_err());
    }

    #[test]
    fn error_ack_survives_wire() -> Result<(), AckgridError> {
        let msg = AckMsg::ErrorAck {
            op: OperationId { origin: 3, seq: 12 },
            topology: 9,
            cause: "write skew on key 'k1'".into(),
        };
        let bytes = msg.encode()?;
        assert!(msg.get_size() >= "write skew on key 'k1'".len());
        assert_eq!(AckMsg::decode(&bytes)?, msg);
        Ok(())
    }

    #[test]
    fn dispatch_to_registry() -> Result<(), AckgridError> {
        let reg = CollectorRegistry::new(0, 0);
        let (a, ha) = reg.create(HashSet::from([1]), 0, 2);
        let (b, hb) = reg.create_segmented(
            HashMap::from([(4, HashSet::from([1])), (5, HashSet::from([2]))]),
            2,
        );
        let (c, hc) = reg.create(HashSet::from([1, 2]), 0, 2);

        let wire = [
            (1, AckMsg::Ack { op: a, topology: 2 }),
            (1, AckMsg::SegmentAck { op: b, topology: 2, segment: 4 }),
            (2, AckMsg::SegmentAck { op: b, topology: 2, segment: 5 }),
            (2, AckMsg::ErrorAck { op: c, topology: 2, cause: "boom".into() }),
        ];
        for (from, msg) in wire {
            assert_eq!(msg.op().origin, 0);
            AckMsg::decode(&msg.encode()?)?.dispatch(from, &reg);
        }

        assert_eq!(ha.result(), Some(Ok(())));
        assert_eq!(hb.result(), Some(Ok(())));
        assert_eq!(
            hc.result(),
            Some(Err(WriteError::Remote {
                from: 2,
                cause: "boom".into()
            }))
        );
        Ok(())
    }
}
