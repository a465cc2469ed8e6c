//! Envelope - the unit of transport between two nodes

use crate::NodeId;

/// One routed message between two nodes.
///
/// `sequence` is a per-sender counter used for duplicate and reordering
/// diagnostics only. The fabric does not deliver in sequence order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope<M> {
    from: NodeId,
    to: NodeId,
    sequence: u64,
    payload: M,
}

impl<M> Envelope<M> {
    pub fn new(from: NodeId, to: NodeId, sequence: u64, payload: M) -> Self {
        Envelope {
            from,
            to,
            sequence,
            payload,
        }
    }

    #[inline]
    pub fn from(&self) -> NodeId {
        self.from
    }

    #[inline]
    pub fn to(&self) -> NodeId {
        self.to
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Consume the envelope, keeping only the payload
    pub fn into_payload(self) -> M {
        self.payload
    }

    /// Split into (from, payload) for handing to an engine
    pub fn into_parts(self) -> (NodeId, M) {
        (self.from, self.payload)
    }
}
