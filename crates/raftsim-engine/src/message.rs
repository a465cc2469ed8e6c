//! Raft protocol messages exchanged through the fabric

use bytes::Bytes;

use crate::engine::Entry;

/// Messages of the reference Raft engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// Highest matching index on success, a retry hint on rejection
        match_index: u64,
    },
    /// Client data forwarded from a follower to its leader. Carries no term.
    Propose { data: Bytes },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
            RaftMessage::Propose { .. } => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "request_vote",
            RaftMessage::RequestVoteResponse { .. } => "request_vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
            RaftMessage::Propose { .. } => "propose",
        }
    }
}
