//! In-process network fabric
//!
//! Routes envelopes between registered mailboxes, consulting the
//! [`FaultPolicy`] once per send. Delayed copies are handed to short-lived
//! tasks that capture the destination mailbox at send time, so a partition
//! applied after a send never retracts an envelope already in flight.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use raftsim_core::{Envelope, NodeId, SimError, SimResult};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{watch, Notify};

use crate::fault::{DropReason, FaultPolicy, Verdict};
use crate::routing::{Mailbox, RoutingTable};

/// Result of a send that reached a registered peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The policy or a closed fabric discarded the envelope, or every
    /// immediate copy found the mailbox full or closed
    Dropped(DropReason),
    /// Handed to the destination mailbox, now or after a delay. A delayed
    /// copy may still be dropped on arrival; only the stats record that.
    Delivered { copies: usize, delayed: bool },
}

impl SendOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, SendOutcome::Dropped(_))
    }
}

/// Fabric statistics snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub sent: u64,
    pub delivered: u64,
    pub duplicated: u64,
    pub delayed: u64,
    pub dropped_partition: u64,
    pub dropped_random: u64,
    pub dropped_mailbox: u64,
    pub unknown_peer: u64,
}

impl FabricStats {
    /// Share of sends lost to the policy
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            (self.dropped_partition + self.dropped_random) as f64 / self.sent as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    duplicated: AtomicU64,
    delayed: AtomicU64,
    dropped_partition: AtomicU64,
    dropped_random: AtomicU64,
    dropped_mailbox: AtomicU64,
    unknown_peer: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self, reason: DropReason) {
        match reason {
            DropReason::Partitioned | DropReason::Isolated => Self::bump(&self.dropped_partition),
            DropReason::Random => Self::bump(&self.dropped_random),
            DropReason::MailboxFull | DropReason::MailboxClosed => Self::bump(&self.dropped_mailbox),
            DropReason::Closed => {}
        }
    }

    fn snapshot(&self) -> FabricStats {
        FabricStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            dropped_partition: self.dropped_partition.load(Ordering::Relaxed),
            dropped_random: self.dropped_random.load(Ordering::Relaxed),
            dropped_mailbox: self.dropped_mailbox.load(Ordering::Relaxed),
            unknown_peer: self.unknown_peer.load(Ordering::Relaxed),
        }
    }

    /// Non-blocking hand-off; a full or closed mailbox drops the envelope
    fn deliver<M>(&self, mailbox: &Mailbox<M>, envelope: Envelope<M>) -> Result<(), DropReason> {
        let (envelope, reason) = match mailbox.try_send(envelope) {
            Ok(()) => {
                Self::bump(&self.delivered);
                return Ok(());
            }
            Err(TrySendError::Full(envelope)) => (envelope, DropReason::MailboxFull),
            Err(TrySendError::Closed(envelope)) => (envelope, DropReason::MailboxClosed),
        };
        tracing::trace!(to = %envelope.to(), seq = envelope.sequence(), ?reason, "mailbox rejected envelope");
        self.record_drop(reason);
        Err(reason)
    }
}

/// Tracks deferred-delivery tasks still alive
#[derive(Default)]
struct Deferred {
    in_flight: AtomicUsize,
    drained: Notify,
}

struct DeferredGuard(Arc<Deferred>);

impl DeferredGuard {
    fn new(deferred: &Arc<Deferred>) -> Self {
        deferred.in_flight.fetch_add(1, Ordering::AcqRel);
        DeferredGuard(Arc::clone(deferred))
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Resolves once the fabric is closed or dropped
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Simulated network connecting every node of a cluster
pub struct NetworkFabric<M> {
    routes: RwLock<RoutingTable<M>>,
    policy: Arc<FaultPolicy>,
    counters: Arc<Counters>,
    deferred: Arc<Deferred>,
    closed: watch::Sender<bool>,
}

impl<M> NetworkFabric<M>
where
    M: Clone + Send + 'static,
{
    pub fn new(policy: Arc<FaultPolicy>) -> Self {
        let (closed, _) = watch::channel(false);
        NetworkFabric {
            routes: RwLock::new(RoutingTable::new()),
            policy,
            counters: Arc::new(Counters::default()),
            deferred: Arc::new(Deferred::default()),
            closed,
        }
    }

    /// Make `id` reachable through `mailbox`
    pub fn register(&self, id: NodeId, mailbox: Mailbox<M>) -> SimResult<()> {
        self.routes.write().insert(id, mailbox)?;
        tracing::debug!(node = %id, "mailbox registered");
        Ok(())
    }

    /// Returns false when `id` was not registered
    pub fn unregister(&self, id: NodeId) -> bool {
        let removed = self.routes.write().remove(id).is_some();
        if removed {
            tracing::debug!(node = %id, "mailbox unregistered");
        }
        removed
    }

    pub fn is_registered(&self, id: NodeId) -> bool {
        self.routes.read().contains(id)
    }

    pub fn registered(&self) -> Vec<NodeId> {
        self.routes.read().ids()
    }

    pub fn policy(&self) -> &Arc<FaultPolicy> {
        &self.policy
    }

    pub fn stats(&self) -> FabricStats {
        self.counters.snapshot()
    }

    /// Deferred deliveries not yet delivered or cancelled
    pub fn in_flight(&self) -> usize {
        self.deferred.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Route one envelope.
    ///
    /// Never blocks. Fails only when the destination is not registered.
    /// Delayed delivery spawns onto the current Tokio runtime.
    pub fn send(&self, envelope: Envelope<M>) -> SimResult<SendOutcome> {
        Counters::bump(&self.counters.sent);

        let to = envelope.to();
        let mailbox = match self.routes.read().get(to) {
            Some(mailbox) => mailbox.clone(),
            None => {
                Counters::bump(&self.counters.unknown_peer);
                return Err(SimError::UnknownPeer(to));
            }
        };

        if self.is_closed() {
            return Ok(SendOutcome::Dropped(DropReason::Closed));
        }

        let delays = match self.policy.decide(envelope.from(), to) {
            Verdict::Drop(reason) => {
                self.counters.record_drop(reason);
                tracing::trace!(from = %envelope.from(), to = %to, ?reason, "envelope dropped");
                return Ok(SendOutcome::Dropped(reason));
            }
            Verdict::Deliver(delays) => delays,
        };

        let copies = delays.len();
        if copies > 1 {
            Counters::bump(&self.counters.duplicated);
        }

        let mut delayed = false;
        let mut handed_off = false;
        let mut rejected = None;
        let mut envelope = Some(envelope);
        for (i, delay) in delays.into_iter().enumerate() {
            let copy = if i + 1 == copies {
                envelope.take()
            } else {
                envelope.clone()
            };
            let Some(copy) = copy else { break };

            if delay.is_zero() {
                match self.counters.deliver(&mailbox, copy) {
                    Ok(()) => handed_off = true,
                    Err(reason) => rejected = Some(reason),
                }
            } else {
                delayed = true;
                self.deliver_later(mailbox.clone(), copy, delay);
            }
        }

        match rejected {
            Some(reason) if !handed_off && !delayed => Ok(SendOutcome::Dropped(reason)),
            _ => Ok(SendOutcome::Delivered { copies, delayed }),
        }
    }

    fn deliver_later(&self, mailbox: Mailbox<M>, envelope: Envelope<M>, delay: Duration) {
        Counters::bump(&self.counters.delayed);
        let guard = DeferredGuard::new(&self.deferred);
        let counters = Arc::clone(&self.counters);
        let mut closed = self.closed.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = counters.deliver(&mailbox, envelope);
                }
                _ = closed_signal(&mut closed) => {
                    tracing::trace!(to = %envelope.to(), "deferred delivery cancelled");
                }
            }
        });
    }

    /// Stop accepting traffic and cancel deferred deliveries without waiting
    /// for their tasks to exit.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!("fabric closed");
        }
    }

    /// Stop accepting traffic, cancel deferred deliveries and wait until
    /// every deferred-delivery task has exited.
    pub async fn shutdown(&self) {
        self.close();

        loop {
            let drained = self.deferred.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.in_flight() == 0 {
                break;
            }
            drained.await;
        }
        tracing::debug!("fabric shut down");
    }
}
