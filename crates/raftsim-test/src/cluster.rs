//! Cluster driver
//!
//! Builds a fabric and one [`NodeRunner`] per id, then offers the
//! operations a consensus test needs: waiting for a leader or for commits,
//! injecting faults, healing and tearing everything down.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use raftsim_core::{NodeId, SimError, SimResult};
use raftsim_engine::{ConsensusEngine, RaftConfig, RaftNode, Status};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::fabric::{FabricStats, NetworkFabric};
use crate::fault::{FaultConfig, FaultPolicy};
use crate::runner::{NodeConfig, NodeRunner};

/// Cluster configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Seed for the engines' election timers
    pub seed: u64,
    /// Status polling period of the wait operations
    pub poll_interval: Duration,
    pub node: NodeConfig,
    pub raft: RaftConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            seed: 0,
            poll_interval: Duration::from_millis(5),
            node: NodeConfig::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_node_config(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    pub fn with_raft_config(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }
}

/// A running cluster of nodes connected by one fabric
pub struct ClusterDriver<E: ConsensusEngine> {
    fabric: Arc<NetworkFabric<E::Message>>,
    nodes: BTreeMap<NodeId, Arc<NodeRunner<E>>>,
    config: ClusterConfig,
    /// Leader observed for each term
    leaders: Mutex<BTreeMap<u64, NodeId>>,
}

impl ClusterDriver<RaftNode> {
    /// Start a cluster of reference Raft nodes
    pub fn new(ids: &[NodeId], policy: impl Into<Arc<FaultPolicy>>) -> SimResult<Self> {
        Self::with_config(ids, policy, ClusterConfig::default())
    }

    pub fn with_config(
        ids: &[NodeId],
        policy: impl Into<Arc<FaultPolicy>>,
        config: ClusterConfig,
    ) -> SimResult<Self> {
        let raft = config.raft.clone().with_seed(config.seed);
        Self::with_engines(ids, policy, config, |id, peers| {
            RaftNode::new(id, peers, raft.clone())
        })
    }
}

impl<E: ConsensusEngine> ClusterDriver<E> {
    /// Start a cluster, building each node's engine with `factory(id, all_ids)`
    pub fn with_engines<F>(
        ids: &[NodeId],
        policy: impl Into<Arc<FaultPolicy>>,
        config: ClusterConfig,
        mut factory: F,
    ) -> SimResult<Self>
    where
        F: FnMut(NodeId, &[NodeId]) -> E,
    {
        if ids.is_empty() {
            return Err(SimError::EmptyCluster);
        }
        if let Some(invalid) = ids.iter().find(|id| !id.is_valid()) {
            return Err(SimError::InvalidNodeId(*invalid));
        }

        let fabric = Arc::new(NetworkFabric::new(policy.into()));
        let mut nodes = BTreeMap::new();
        for &id in ids {
            if nodes.contains_key(&id) {
                return Err(SimError::DuplicateRegistration(id));
            }
            let runner = NodeRunner::new(factory(id, ids), Arc::clone(&fabric), config.node.clone());
            nodes.insert(id, Arc::new(runner));
        }

        for (started, runner) in nodes.values().enumerate() {
            if let Err(e) = runner.start() {
                tracing::warn!(
                    node = %runner.id(),
                    error = %e,
                    "node failed to start, tearing cluster down"
                );
                for runner in nodes.values().take(started) {
                    runner.request_stop();
                }
                fabric.close();
                return Err(e);
            }
        }
        tracing::info!(nodes = nodes.len(), seed = config.seed, "cluster started");

        Ok(ClusterDriver {
            fabric,
            nodes,
            config,
            leaders: Mutex::new(BTreeMap::new()),
        })
    }

    /// Node ids in ascending order
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Majority of the configured membership
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<NodeRunner<E>>> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeRunner<E>>> {
        self.nodes.values()
    }

    pub fn fabric(&self) -> &Arc<NetworkFabric<E::Message>> {
        &self.fabric
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Propose through the node `id`
    pub async fn propose(&self, id: NodeId, data: impl Into<Bytes>) -> SimResult<()> {
        let node = self.node(id).ok_or(SimError::UnknownPeer(id))?;
        node.propose(data).await
    }

    /// Statuses of the running nodes
    pub fn statuses(&self) -> Vec<Status> {
        self.nodes
            .values()
            .filter(|n| n.is_running())
            .map(|n| n.status())
            .collect()
    }

    /// One status poll. Records every (term, leader) claim and returns the
    /// leader of the highest term acknowledged by a quorum, if any.
    fn observe_leader(&self) -> SimResult<Option<NodeId>> {
        let statuses = self.statuses();
        let mut votes: HashMap<(u64, NodeId), usize> = HashMap::new();

        {
            let mut leaders = self.leaders.lock();
            for status in &statuses {
                let Some(leader) = status.leader else { continue };

                match leaders.get(&status.term) {
                    Some(&known) if known != leader => {
                        tracing::error!(term = status.term, first = %known, second = %leader, "two leaders in one term");
                        return Err(SimError::SplitBrain {
                            term: status.term,
                            first: known,
                            second: leader,
                        });
                    }
                    Some(_) => {}
                    None => {
                        leaders.insert(status.term, leader);
                    }
                }

                match votes.entry((status.term, leader)) {
                    MapEntry::Occupied(mut o) => *o.get_mut() += 1,
                    MapEntry::Vacant(v) => {
                        v.insert(1);
                    }
                }
            }
        }

        let quorum = self.quorum();
        Ok(votes
            .into_iter()
            .filter(|(_, count)| *count >= quorum)
            .max_by_key(|((term, _), _)| *term)
            .map(|((_, leader), _)| leader))
    }

    /// Poll until a quorum of nodes agrees on one leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> SimResult<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.observe_leader()? {
                let term = self.node(leader).map(|n| n.status().term).unwrap_or_default();
                tracing::info!(leader = %leader, term, "leader elected");
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(SimError::NoLeaderElected { timeout });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Fails with `SplitBrain` if two nodes ever claimed different leaders
    /// for the same term.
    pub fn check_election_safety(&self) -> SimResult<()> {
        self.observe_leader().map(|_| ())
    }

    /// Leaders recorded so far, by term
    pub fn leader_history(&self) -> BTreeMap<u64, NodeId> {
        self.leaders.lock().clone()
    }

    /// Poll until every running node has committed at least `count` client
    /// entries.
    pub async fn wait_for_commit(&self, count: usize, timeout: Duration) -> SimResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let done = self
                .nodes
                .values()
                .filter(|n| n.is_running())
                .all(|n| n.committed_len() >= count);
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SimError::CommitTimeout {
                    expected: count,
                    timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub fn stats(&self) -> FabricStats {
        self.fabric.stats()
    }

    /// The shared fault policy; mutations apply to subsequent sends
    pub fn faults(&self) -> &Arc<FaultPolicy> {
        self.fabric.policy()
    }

    pub fn inject_faults(&self, config: FaultConfig) {
        tracing::info!(
            drop_rate = config.drop_rate,
            duplicate_rate = config.duplicate_rate,
            "injecting faults"
        );
        self.faults().set_config(config);
    }

    pub fn partition<G, I>(&self, groups: G)
    where
        G: IntoIterator<Item = I>,
        I: IntoIterator<Item = NodeId>,
    {
        self.faults().partition(groups);
    }

    pub fn isolate(&self, id: NodeId) {
        self.faults().isolate(id);
    }

    pub fn rejoin(&self, id: NodeId) {
        self.faults().rejoin(id);
    }

    /// Remove partitions and isolation
    pub fn heal(&self) {
        self.faults().heal();
    }

    /// Stop one node. Unknown ids are ignored.
    pub async fn stop_node(&self, id: NodeId) {
        if let Some(node) = self.node(id) {
            node.stop().await;
        }
    }

    /// Stop every node concurrently, then shut the fabric down. On return no
    /// node task or deferred delivery is alive.
    pub async fn stop_all(&self) {
        let mut stops = JoinSet::new();
        for node in self.nodes.values() {
            let node = Arc::clone(node);
            stops.spawn(async move { node.stop().await });
        }
        while let Some(res) = stops.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "node stop task failed");
            }
        }

        self.fabric.shutdown().await;
        tracing::info!(nodes = self.nodes.len(), "cluster stopped");
    }
}
