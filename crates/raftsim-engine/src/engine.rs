//! Consensus engine boundary
//!
//! The harness never looks inside an engine. It only ticks it, steps inbound
//! messages into it, hands it client proposals, pulls ready output and reads
//! a status snapshot. Any engine implementing [`ConsensusEngine`] can be run
//! behind the harness unchanged.

use std::fmt;

use bytes::Bytes;
use raftsim_core::{NodeId, SimResult};

/// Role of a node within its current term
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Cheap snapshot of an engine's view of the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Status {
    pub id: NodeId,
    pub term: u64,
    /// Leader this node currently follows (itself when leading)
    pub leader: Option<NodeId>,
    pub role: Role,
    pub commit_index: u64,
    pub last_index: u64,
}

impl Status {
    pub fn new(id: NodeId) -> Self {
        Status {
            id,
            ..Default::default()
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Same term, leader and role. Index progress is ignored.
    pub fn same_soft_state(&self, other: &Status) -> bool {
        self.term == other.term && self.leader == other.leader && self.role == other.role
    }
}

/// A replicated log entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    /// Client data. Empty for the no-op a new leader appends.
    pub data: Bytes,
}

impl Entry {
    pub fn new(term: u64, index: u64, data: Bytes) -> Self {
        Entry { term, index, data }
    }

    pub fn is_noop(&self) -> bool {
        self.data.is_empty()
    }
}

/// Output batch of one processing cycle
#[derive(Clone, Debug)]
pub struct Ready<M> {
    /// Messages to route to peers
    pub messages: Vec<(NodeId, M)>,
    /// Entries that became committed since the previous batch, in log order
    pub committed_entries: Vec<Entry>,
    /// Present when term, leader or role changed since the previous batch
    pub status: Option<Status>,
}

impl<M> Ready<M> {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.committed_entries.is_empty() && self.status.is_none()
    }
}

impl<M> Default for Ready<M> {
    fn default() -> Self {
        Ready {
            messages: Vec::new(),
            committed_entries: Vec::new(),
            status: None,
        }
    }
}

/// The capability set the harness needs from a consensus engine.
///
/// An engine instance is driven by exactly one task, so methods take
/// `&mut self` and need no internal locking.
pub trait ConsensusEngine: Send + 'static {
    /// Protocol message exchanged between engines
    type Message: Clone + fmt::Debug + Send + Sync + 'static;

    fn id(&self) -> NodeId;

    /// Advance the engine's logical clock by one tick
    fn tick(&mut self);

    /// Feed one inbound protocol message
    fn step(&mut self, from: NodeId, msg: Self::Message);

    /// Submit client data for replication. Returns once the engine has taken
    /// the data, never waits for commit.
    fn propose(&mut self, data: Bytes) -> SimResult<()>;

    /// Whether [`ConsensusEngine::ready`] would return a non-empty batch
    fn has_ready(&self) -> bool;

    /// Take the pending output batch
    fn ready(&mut self) -> Ready<Self::Message>;

    fn status(&self) -> Status;

    /// Release engine resources. Called once when the owning node stops.
    fn stop(&mut self) {}
}
