//! Node runner - per-node event loop
//!
//! Each node's engine is owned by exactly one task. That task multiplexes:
//! - The shutdown and pause signals
//! - Client proposals (bounded queue, one reply per proposal)
//! - Inbound envelopes from the node's mailbox
//! - The tick timer
//!
//! After every wake-up it drains the engine's ready output: messages go to
//! the fabric, committed entries go to the node's committed log.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use raftsim_core::{Envelope, NodeId, SimError, SimResult};
use raftsim_engine::{ConsensusEngine, Entry, Status};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adapter::EngineAdapter;
use crate::fabric::NetworkFabric;
use crate::routing::{mailbox, Mailbox, MailboxReceiver};

/// Node runner configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Tick interval
    pub tick_interval: Duration,
    /// Inbound envelope queue capacity
    pub mailbox_capacity: usize,
    /// Pending proposal queue capacity
    pub proposal_capacity: usize,
    /// Envelopes stepped per wake-up before output is drained
    pub max_mailbox_batch: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            tick_interval: Duration::from_millis(10),
            mailbox_capacity: 1024,
            proposal_capacity: 256,
            max_mailbox_batch: 64,
        }
    }
}

/// Lifecycle of a node: created -> running -> stopping -> stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Proposal {
    data: Bytes,
    reply: oneshot::Sender<SimResult<()>>,
}

/// Handle to one node of the cluster
pub struct NodeRunner<E: ConsensusEngine> {
    id: NodeId,
    fabric: Arc<NetworkFabric<E::Message>>,
    inbox: Mailbox<E::Message>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    status: watch::Receiver<Status>,
    committed: Arc<RwLock<Vec<Entry>>>,
    proposals: mpsc::Sender<Proposal>,
    shutdown: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    /// Event loop parked between construction and start
    pending: Mutex<Option<EventLoop<E>>>,
    /// Serializes start against stop
    transition: Mutex<()>,
}

impl<E: ConsensusEngine> NodeRunner<E> {
    pub fn new(engine: E, fabric: Arc<NetworkFabric<E::Message>>, config: NodeConfig) -> Self {
        let id = engine.id();
        let adapter = EngineAdapter::new(engine);
        let status = adapter.subscribe();
        let (inbox, mailbox_rx) = mailbox(config.mailbox_capacity);
        let (proposals, proposals_rx) = mpsc::channel(config.proposal_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (paused, paused_rx) = watch::channel(false);
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        let committed = Arc::new(RwLock::new(Vec::new()));

        let event_loop = EventLoop {
            id,
            adapter,
            fabric: Arc::clone(&fabric),
            mailbox: mailbox_rx,
            proposals: proposals_rx,
            shutdown: shutdown_rx,
            paused: paused_rx,
            committed: Arc::clone(&committed),
            tick_interval: config.tick_interval,
            max_batch: config.max_mailbox_batch.max(1),
            next_sequence: 1,
            last_status: None,
        };

        NodeRunner {
            id,
            fabric,
            inbox,
            lifecycle: Arc::new(lifecycle),
            status,
            committed,
            proposals,
            shutdown,
            paused,
            pending: Mutex::new(Some(event_loop)),
            transition: Mutex::new(()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Last status published by the event loop
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Register the mailbox and spawn the event loop.
    ///
    /// Starting a running node is a no-op. A stopped node cannot restart.
    pub fn start(&self) -> SimResult<()> {
        let _transition = self.transition.lock();
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopping | Lifecycle::Stopped => {
                return Err(SimError::NodeNotRunning(self.id))
            }
        }

        let Some(event_loop) = self.pending.lock().take() else {
            return Err(SimError::NodeNotRunning(self.id));
        };
        if let Err(e) = self.fabric.register(self.id, self.inbox.clone()) {
            *self.pending.lock() = Some(event_loop);
            return Err(e);
        }

        self.lifecycle.send_replace(Lifecycle::Running);
        let handle = tokio::spawn(event_loop.run());
        tokio::spawn(supervise(
            self.id,
            handle,
            Arc::clone(&self.fabric),
            Arc::clone(&self.lifecycle),
        ));
        tracing::debug!(node = %self.id, "node started");
        Ok(())
    }

    /// Hand data to the engine. Resolves once the engine accepted or
    /// rejected it, never waits for commit.
    pub async fn propose(&self, data: impl Into<Bytes>) -> SimResult<()> {
        if !self.is_running() {
            return Err(SimError::NodeNotRunning(self.id));
        }

        let (reply, rx) = oneshot::channel();
        let proposal = Proposal {
            data: data.into(),
            reply,
        };
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| SimError::NodeNotRunning(self.id))?;
        rx.await.map_err(|_| SimError::NodeNotRunning(self.id))?
    }

    /// Stop the event loop and wait for it to exit.
    ///
    /// Idempotent: concurrent and repeated calls all return once the node
    /// has fully stopped. Dropping the returned future does not abandon the
    /// teardown.
    pub async fn stop(&self) {
        self.request_stop();

        let mut lifecycle = self.lifecycle.subscribe();
        while *lifecycle.borrow_and_update() != Lifecycle::Stopped {
            if lifecycle.changed().await.is_err() {
                break;
            }
        }
    }

    /// Signal the node to stop without waiting for it.
    ///
    /// A node that never started stops on the spot. A running node is torn
    /// down by its supervisor once the event loop exits. Returns false if the
    /// node was already stopping or stopped.
    pub fn request_stop(&self) -> bool {
        let _transition = self.transition.lock();
        match self.lifecycle() {
            Lifecycle::Created => {
                if let Some(mut event_loop) = self.pending.lock().take() {
                    event_loop.adapter.stop();
                }
                self.lifecycle.send_replace(Lifecycle::Stopped);
                tracing::debug!(node = %self.id, "node stopped before start");
                true
            }
            Lifecycle::Running => {
                self.lifecycle.send_replace(Lifecycle::Stopping);
                self.shutdown.send_replace(true);
                tracing::debug!(node = %self.id, "node stopping");
                true
            }
            Lifecycle::Stopping | Lifecycle::Stopped => false,
        }
    }

    /// Stop ticking and reading the mailbox. Proposals are still accepted.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::debug!(node = %self.id, "node paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::debug!(node = %self.id, "node resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Every entry committed on this node, in log order
    pub fn committed(&self) -> Vec<Entry> {
        self.committed.read().clone()
    }

    /// Client data committed on this node, skipping leader no-ops
    pub fn committed_data(&self) -> Vec<Bytes> {
        self.committed
            .read()
            .iter()
            .filter(|e| !e.is_noop())
            .map(|e| e.data.clone())
            .collect()
    }

    /// Number of committed client entries
    pub fn committed_len(&self) -> usize {
        self.committed.read().iter().filter(|e| !e.is_noop()).count()
    }
}

/// Owns the teardown of a started node: waits for the event loop to exit,
/// then unregisters the mailbox and marks the node stopped.
async fn supervise<M: Clone + Send + 'static>(
    id: NodeId,
    event_loop: JoinHandle<()>,
    fabric: Arc<NetworkFabric<M>>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) {
    if let Err(e) = event_loop.await {
        tracing::warn!(node = %id, error = %e, "event loop task failed");
    }
    fabric.unregister(id);
    lifecycle.send_replace(Lifecycle::Stopped);
    tracing::debug!(node = %id, "node stopped");
}

struct EventLoop<E: ConsensusEngine> {
    id: NodeId,
    adapter: EngineAdapter<E>,
    fabric: Arc<NetworkFabric<E::Message>>,
    mailbox: MailboxReceiver<E::Message>,
    proposals: mpsc::Receiver<Proposal>,
    shutdown: watch::Receiver<bool>,
    paused: watch::Receiver<bool>,
    committed: Arc<RwLock<Vec<Entry>>>,
    tick_interval: Duration,
    max_batch: usize,
    next_sequence: u64,
    last_status: Option<Status>,
}

impl<E: ConsensusEngine> EventLoop<E> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(node = %self.id, "event loop started");

        loop {
            if *self.shutdown.borrow_and_update() {
                break;
            }
            let paused = *self.paused.borrow_and_update();

            tokio::select! {
                biased;

                res = self.shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
                res = self.paused.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
                Some(proposal) = self.proposals.recv() => {
                    let result = self.adapter.propose(proposal.data);
                    let _ = proposal.reply.send(result);
                }
                Some(envelope) = self.mailbox.recv(), if !paused => {
                    self.adapter.step(envelope);
                    self.drain_mailbox();
                }
                _ = ticker.tick(), if !paused => {
                    self.adapter.tick();
                }
            }

            self.process_ready();
        }

        self.adapter.stop();
        tracing::debug!(node = %self.id, "event loop exited");
    }

    fn drain_mailbox(&mut self) {
        for _ in 1..self.max_batch {
            match self.mailbox.try_recv() {
                Ok(envelope) => self.adapter.step(envelope),
                Err(_) => break,
            }
        }
    }

    fn process_ready(&mut self) {
        while let Some(ready) = self.adapter.ready() {
            for (to, msg) in ready.messages {
                let envelope = Envelope::new(self.id, to, self.next_sequence, msg);
                self.next_sequence += 1;
                if let Err(e) = self.fabric.send(envelope) {
                    tracing::trace!(node = %self.id, error = %e, "send failed");
                }
            }

            if !ready.committed_entries.is_empty() {
                self.committed.write().extend(ready.committed_entries);
            }

            if let Some(status) = ready.status {
                self.observe(status);
            }
        }
    }

    fn observe(&mut self, status: Status) {
        let previous = self.last_status.replace(status);
        let was_leader = previous.is_some_and(|p| p.is_leader());

        if status.is_leader() && !was_leader {
            tracing::info!(node = %self.id, term = status.term, "became leader");
        } else if was_leader && !status.is_leader() {
            tracing::info!(node = %self.id, term = status.term, "lost leadership");
        } else if previous.map(|p| p.leader) != Some(status.leader) {
            tracing::debug!(
                node = %self.id,
                term = status.term,
                leader = ?status.leader,
                role = %status.role,
                "leader changed"
            );
        }
    }
}
