//! Identity types for simulated cluster members

use std::fmt;

/// Node identity - a positive integer assigned by the test driver before startup.
///
/// `NodeId::ZERO` is reserved to mean "no node" and is never a valid member.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ZERO: NodeId = NodeId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    /// True for every id except the reserved zero id
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build a list of node ids from raw integers
pub fn node_ids(ids: impl IntoIterator<Item = u64>) -> Vec<NodeId> {
    ids.into_iter().map(NodeId::new).collect()
}
