//! Node id to mailbox routing

use std::collections::HashMap;

use raftsim_core::{Envelope, NodeId, SimError, SimResult};
use tokio::sync::mpsc;

/// Sending half of a node's inbound queue
pub type Mailbox<M> = mpsc::Sender<Envelope<M>>;

/// Receiving half, owned by the node's event loop
pub type MailboxReceiver<M> = mpsc::Receiver<Envelope<M>>;

/// Create a bounded mailbox
pub fn mailbox<M>(capacity: usize) -> (Mailbox<M>, MailboxReceiver<M>) {
    mpsc::channel(capacity.max(1))
}

/// Registered mailboxes keyed by node id
pub struct RoutingTable<M> {
    mailboxes: HashMap<NodeId, Mailbox<M>>,
}

impl<M> RoutingTable<M> {
    pub fn new() -> Self {
        RoutingTable {
            mailboxes: HashMap::new(),
        }
    }

    /// Register a mailbox. At most one per id.
    pub fn insert(&mut self, id: NodeId, mailbox: Mailbox<M>) -> SimResult<()> {
        if self.mailboxes.contains_key(&id) {
            return Err(SimError::DuplicateRegistration(id));
        }
        self.mailboxes.insert(id, mailbox);
        Ok(())
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Mailbox<M>> {
        self.mailboxes.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Mailbox<M>> {
        self.mailboxes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.mailboxes.contains_key(&id)
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.mailboxes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

impl<M> Default for RoutingTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
