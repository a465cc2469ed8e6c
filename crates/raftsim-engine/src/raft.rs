//! Reference Raft engine
//!
//! A compact, tick-driven Raft used to exercise the harness. It covers
//! leader election, log replication and commit; it keeps its log in memory
//! and has no snapshots or membership changes.

use std::collections::{HashMap, HashSet};
use std::mem;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raftsim_core::{NodeId, SimError, SimResult};

use crate::engine::{ConsensusEngine, Entry, Ready, Role, Status};
use crate::message::RaftMessage;

/// Raft timing and flow-control configuration
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Base election timeout in ticks. The effective timeout is drawn from
    /// `[election_tick, 2 * election_tick)` after every reset.
    pub election_tick: u32,
    /// Leader heartbeat interval in ticks
    pub heartbeat_tick: u32,
    /// Maximum entries carried by one AppendEntries
    pub max_entries_per_msg: usize,
    /// Leader refuses proposals once this many entries are uncommitted
    pub max_uncommitted_entries: usize,
    /// Seed for the election timeout RNG
    pub seed: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_tick: 10,
            heartbeat_tick: 1,
            max_entries_per_msg: 64,
            max_uncommitted_entries: 512,
            seed: 0,
        }
    }
}

impl RaftConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Leader's replication cursor for one follower
#[derive(Clone, Copy, Debug)]
struct Progress {
    next: u64,
    matched: u64,
}

/// A single Raft participant
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    rng: StdRng,

    term: u64,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,

    /// Entry with index `i` lives at `log[i - 1]`
    log: Vec<Entry>,
    commit_index: u64,
    applied_index: u64,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_timeout: u32,

    votes: HashSet<NodeId>,
    progress: HashMap<NodeId, Progress>,

    msgs: Vec<(NodeId, RaftMessage)>,
    /// Soft state last handed out through `ready`
    reported: Status,
}

impl RaftNode {
    /// Create a node. `peers` may include `id` itself; it is filtered out.
    pub fn new(id: NodeId, peers: &[NodeId], config: RaftConfig) -> Self {
        let mut others: Vec<NodeId> = peers.iter().copied().filter(|p| *p != id).collect();
        others.sort_unstable();
        others.dedup();

        let seed = config.seed ^ id.get().wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let mut node = RaftNode {
            id,
            peers: others,
            config,
            rng: StdRng::seed_from_u64(seed),
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            log: Vec::new(),
            commit_index: 0,
            applied_index: 0,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            votes: HashSet::new(),
            progress: HashMap::new(),
            msgs: Vec::new(),
            reported: Status::new(id),
        };
        node.reset_election_timeout();
        node.reported = node.status();
        node
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn log(&self) -> &[Entry] {
        &self.log
    }

    pub fn randomized_election_timeout(&self) -> u32 {
        self.randomized_election_timeout
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn last_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|e| e.term)
    }

    fn send(&mut self, to: NodeId, msg: RaftMessage) {
        self.msgs.push((to, msg));
    }

    fn reset_election_timeout(&mut self) {
        self.election_elapsed = 0;
        let base = self.config.election_tick.max(1);
        self.randomized_election_timeout = self.rng.gen_range(base..base * 2);
    }

    // ========================================================================
    // ROLE TRANSITIONS
    // ========================================================================

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.progress.clear();
        self.reset_election_timeout();
    }

    fn campaign(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timeout();

        tracing::debug!(node = %self.id, term = self.term, "starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let (last_log_index, last_log_term) = (self.last_index(), self.last_term());
        for peer in self.peers.clone() {
            self.send(
                peer,
                RaftMessage::RequestVote {
                    term: self.term,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.votes.clear();

        let next = self.last_index() + 1;
        self.progress = self
            .peers
            .iter()
            .map(|p| (*p, Progress { next, matched: 0 }))
            .collect();

        // Committing a no-op from the new term commits everything before it
        let index = self.last_index() + 1;
        self.log.push(Entry::new(self.term, index, Bytes::new()));

        tracing::debug!(node = %self.id, term = self.term, "became leader");

        self.maybe_commit();
        self.broadcast_append();
    }

    // ========================================================================
    // REPLICATION
    // ========================================================================

    fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let last = self.last_index();
        let Some(pr) = self.progress.get_mut(&to) else {
            return;
        };
        pr.next = pr.next.clamp(1, last + 1);

        let prev_log_index = pr.next - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let start = prev_log_index as usize;
        let end = (start + self.config.max_entries_per_msg).min(self.log.len());
        let entries = self.log[start..end].to_vec();

        self.send(
            to,
            RaftMessage::AppendEntries {
                term: self.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    fn maybe_commit(&mut self) -> bool {
        let mut matched: Vec<u64> = self.progress.values().map(|p| p.matched).collect();
        matched.push(self.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        // Only entries from the current term are committed by counting
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    fn append_local(&mut self, data: Bytes) -> SimResult<()> {
        let uncommitted = (self.last_index() - self.commit_index) as usize;
        if uncommitted >= self.config.max_uncommitted_entries {
            return Err(SimError::ProposalDropped(self.id));
        }
        let index = self.last_index() + 1;
        self.log.push(Entry::new(self.term, index, data));
        self.maybe_commit();
        Ok(())
    }

    // ========================================================================
    // MESSAGE HANDLERS
    // ========================================================================

    fn handle_request_vote(&mut self, from: NodeId, last_log_index: u64, last_log_term: u64) {
        let can_vote = self.voted_for.map_or(true, |v| v == from);
        let up_to_date = last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index());
        let granted = can_vote && up_to_date;

        if granted {
            self.voted_for = Some(from);
            self.election_elapsed = 0;
        }

        self.send(
            from,
            RaftMessage::RequestVoteResponse {
                term: self.term,
                granted,
            },
        );
    }

    fn handle_vote_response(&mut self, from: NodeId, granted: bool) {
        if self.role != Role::Candidate || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        from: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    ) {
        if self.role != Role::Follower {
            self.become_follower(self.term, Some(from));
        }
        self.leader = Some(from);
        self.election_elapsed = 0;

        if self.term_at(prev_log_index) != Some(prev_log_term) {
            let hint = self.last_index().min(prev_log_index.saturating_sub(1));
            self.send(
                from,
                RaftMessage::AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: hint,
                },
            );
            return;
        }

        let last_new = prev_log_index + entries.len() as u64;
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    debug_assert!(entry.index > self.commit_index, "committed entry overwritten");
                    self.log.truncate(entry.index as usize - 1);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }

        let new_commit = leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        self.send(
            from,
            RaftMessage::AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: last_new,
            },
        );
    }

    fn handle_append_response(&mut self, from: NodeId, success: bool, match_index: u64) {
        if self.role != Role::Leader {
            return;
        }
        let last = self.last_index();
        let Some(pr) = self.progress.get_mut(&from) else {
            return;
        };

        if success {
            pr.matched = pr.matched.max(match_index);
            pr.next = pr.next.max(pr.matched + 1);
            let behind = pr.next <= last;
            self.maybe_commit();
            if behind {
                self.send_append(from);
            }
        } else {
            pr.next = (match_index + 1).max(pr.matched + 1);
            self.send_append(from);
        }
    }

    fn handle_forwarded_proposal(&mut self, from: NodeId, data: Bytes) {
        if self.role == Role::Leader {
            if let Err(e) = self.append_local(data) {
                tracing::trace!(node = %self.id, from = %from, error = %e, "forwarded proposal dropped");
            }
        }
    }
}

impl ConsensusEngine for RaftNode {
    type Message = RaftMessage;

    fn id(&self) -> NodeId {
        self.id
    }

    fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick.max(1) {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.campaign();
                }
            }
        }
    }

    fn step(&mut self, from: NodeId, msg: RaftMessage) {
        if let RaftMessage::Propose { data } = msg {
            self.handle_forwarded_proposal(from, data);
            return;
        }

        let term = msg.term();
        if term > self.term {
            let leader = matches!(msg, RaftMessage::AppendEntries { .. }).then_some(from);
            self.become_follower(term, leader);
        } else if term < self.term {
            // Answer stale requests with our term so the sender steps down
            match msg {
                RaftMessage::RequestVote { .. } => self.send(
                    from,
                    RaftMessage::RequestVoteResponse {
                        term: self.term,
                        granted: false,
                    },
                ),
                RaftMessage::AppendEntries { .. } => self.send(
                    from,
                    RaftMessage::AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        match_index: 0,
                    },
                ),
                _ => {}
            }
            return;
        }

        match msg {
            RaftMessage::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(from, last_log_index, last_log_term),
            RaftMessage::RequestVoteResponse { granted, .. } => {
                self.handle_vote_response(from, granted)
            }
            RaftMessage::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                ..
            } => self.handle_append_entries(from, prev_log_index, prev_log_term, entries, leader_commit),
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
                ..
            } => self.handle_append_response(from, success, match_index),
            RaftMessage::Propose { .. } => {}
        }
    }

    fn propose(&mut self, data: Bytes) -> SimResult<()> {
        match (self.role, self.leader) {
            (Role::Leader, _) => self.append_local(data),
            (_, Some(leader)) => {
                self.send(leader, RaftMessage::Propose { data });
                Ok(())
            }
            (_, None) => Err(SimError::ProposalDropped(self.id)),
        }
    }

    fn has_ready(&self) -> bool {
        !self.msgs.is_empty()
            || self.commit_index > self.applied_index
            || !self.status().same_soft_state(&self.reported)
    }

    fn ready(&mut self) -> Ready<RaftMessage> {
        let messages = mem::take(&mut self.msgs);

        let committed_entries = if self.commit_index > self.applied_index {
            self.log[self.applied_index as usize..self.commit_index as usize].to_vec()
        } else {
            Vec::new()
        };
        self.applied_index = self.commit_index;

        let current = self.status();
        let status = if current.same_soft_state(&self.reported) {
            None
        } else {
            self.reported = current;
            Some(current)
        };

        Ready {
            messages,
            committed_entries,
            status,
        }
    }

    fn status(&self) -> Status {
        Status {
            id: self.id,
            term: self.term,
            leader: self.leader,
            role: self.role,
            commit_index: self.commit_index,
            last_index: self.last_index(),
        }
    }
}
