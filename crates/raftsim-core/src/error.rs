//! Error types for the simulated cluster harness

use std::time::Duration;

use thiserror::Error;

use crate::NodeId;

/// Harness errors.
///
/// Simulated delivery faults (drop, duplicate, delay) are never errors. Only
/// structural misuse and explicit timeouts surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    // Routing errors
    #[error("Unknown peer: node {0} is not registered")]
    UnknownPeer(NodeId),

    #[error("Duplicate registration for node {0}")]
    DuplicateRegistration(NodeId),

    // Node lifecycle errors
    #[error("Node {0} is not running")]
    NodeNotRunning(NodeId),

    #[error("Proposal dropped by node {0}")]
    ProposalDropped(NodeId),

    // Cluster errors
    #[error("No leader elected within {timeout:?}")]
    NoLeaderElected { timeout: Duration },

    #[error("Split brain in term {term}: nodes {first} and {second} both lead")]
    SplitBrain {
        term: u64,
        first: NodeId,
        second: NodeId,
    },

    #[error("Fewer than {expected} entries committed on every node within {timeout:?}")]
    CommitTimeout { expected: usize, timeout: Duration },

    // Setup errors
    #[error("Invalid node id: {0}")]
    InvalidNodeId(NodeId),

    #[error("Cluster has no nodes")]
    EmptyCluster,
}

/// Result type for harness operations
pub type SimResult<T> = Result<T, SimError>;
