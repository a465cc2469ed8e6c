//! Engine adapter
//!
//! Thin wrapper owned by a node's event loop. Gates the engine behind a
//! stopped flag and publishes its status so other tasks can read it without
//! touching the engine.

use bytes::Bytes;
use raftsim_core::{Envelope, NodeId, SimError, SimResult};
use raftsim_engine::{ConsensusEngine, Ready, Status};
use tokio::sync::watch;

pub struct EngineAdapter<E: ConsensusEngine> {
    engine: E,
    status: watch::Sender<Status>,
    stopped: bool,
}

impl<E: ConsensusEngine> EngineAdapter<E> {
    pub fn new(engine: E) -> Self {
        let (status, _) = watch::channel(engine.status());
        EngineAdapter {
            engine,
            status,
            stopped: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.engine.id()
    }

    /// Receiver of every status the adapter publishes
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn propose(&mut self, data: Bytes) -> SimResult<()> {
        if self.stopped {
            return Err(SimError::NodeNotRunning(self.id()));
        }
        self.engine.propose(data)
    }

    pub fn step(&mut self, envelope: Envelope<E::Message>) {
        if self.stopped {
            return;
        }
        let (from, msg) = envelope.into_parts();
        self.engine.step(from, msg);
    }

    pub fn tick(&mut self) {
        if !self.stopped {
            self.engine.tick();
        }
    }

    /// Take pending output, publishing the engine status alongside it.
    /// Always `None` once stopped.
    pub fn ready(&mut self) -> Option<Ready<E::Message>> {
        if self.stopped || !self.engine.has_ready() {
            return None;
        }
        let ready = self.engine.ready();
        self.publish();
        Some(ready)
    }

    pub fn status(&self) -> Status {
        self.engine.status()
    }

    fn publish(&self) {
        let status = self.engine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Stop the engine. Later calls are no-ops.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.engine.stop();
        self.publish();
    }
}
