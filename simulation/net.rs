//! Latency-injecting tokio transport.
//!
//! Every send spawns its own delivery task that sleeps a uniformly random
//! delay before pushing the envelope into the receiver's mailbox, so delivery
//! order is arbitrary across senders and between a single pair of nodes —
//! exactly the contract the protocol core is specified against. Sends are
//! fire-and-forget: an unregistered or torn-down peer drops the message with
//! a warning and nothing else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::warn;

use spantree_protocol::{Envelope, NodeId, PeerHandle, Transport};

/// One unit of work for a node's worker task.
#[derive(Debug)]
pub enum NodeInput {
    /// Driver-triggered spontaneous wake.
    Wake,
    /// A delivered protocol message.
    Message(Envelope),
}

/// Counter of scheduled-but-unprocessed inputs across the whole network.
///
/// A send increments it before the delivery task is spawned and the receiving
/// worker decrements it only after the handler returned, so the count can
/// only reach zero when no message is in flight anywhere and no handler is
/// mid-execution — the network is quiescent.
#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn complete(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) async fn quiescent(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Asynchronous in-process network with per-message random delay.
pub struct SimNetwork {
    mailboxes: Mutex<HashMap<NodeId, UnboundedSender<NodeInput>>>,
    rng: Mutex<StdRng>,
    max_delay: Duration,
    in_flight: Arc<InFlight>,
}

impl SimNetwork {
    /// Create a network delivering with delays uniform in `0..=max_delay`,
    /// reproducible from `seed`.
    pub fn new(max_delay: Duration, seed: u64) -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            max_delay,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Register a node's mailbox; must happen before anything sends to it.
    pub fn register(&self, id: NodeId, mailbox: UnboundedSender<NodeInput>) {
        self.mailboxes_guard().insert(id, mailbox);
    }

    /// Schedule a spontaneous wake for `id` after `delay`.
    pub fn inject_wake(&self, id: NodeId, delay: Duration) {
        let Some(mailbox) = self.mailboxes_guard().get(&id).cloned() else {
            warn!(node = id, "wake for unregistered node dropped");
            return;
        };
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.add();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if mailbox.send(NodeInput::Wake).is_err() {
                in_flight.complete();
            }
        });
    }

    /// Mark one input as fully processed; called by the node workers.
    pub fn complete_delivery(&self) {
        self.in_flight.complete();
    }

    /// Resolve once no input is scheduled, in flight or being handled.
    pub async fn quiescent(&self) {
        self.in_flight.quiescent().await;
    }

    /// Tear the network down: drop every mailbox so the node workers see
    /// end-of-input and return their actors.
    pub fn shutdown(&self) {
        self.mailboxes_guard().clear();
    }

    fn mailboxes_guard(&self) -> MutexGuard<'_, HashMap<NodeId, UnboundedSender<NodeInput>>> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn random_delay(&self) -> Duration {
        let cap = self.max_delay.as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        let millis = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..=cap)
        };
        Duration::from_millis(millis)
    }
}

impl Transport for SimNetwork {
    fn resolve(&self, peer: NodeId) -> Option<PeerHandle> {
        self.mailboxes_guard()
            .contains_key(&peer)
            .then(|| PeerHandle::new(peer))
    }

    fn send(&self, handle: &PeerHandle, envelope: Envelope) {
        let Some(mailbox) = self.mailboxes_guard().get(&handle.id()).cloned() else {
            warn!(peer = handle.id(), "peer vanished between resolve and send");
            return;
        };
        let delay = self.random_delay();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.add();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if mailbox.send(NodeInput::Message(envelope)).is_err() {
                // receiver torn down after quiescence; nothing to deliver to
                in_flight.complete();
            }
        });
    }
}
