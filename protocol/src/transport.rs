//! Core-to-transport contract.
//!
//! The protocol state machine never talks to the network directly: it resolves
//! a peer identifier to an opaque handle and hands envelopes to [`Transport::send`].
//! Delivery is asynchronous, at-most-once and unordered relative to other
//! sends, including sends between the same pair of nodes. A send never blocks
//! and never reports failure back to the caller; an unresolvable peer makes
//! the whole send a silent no-op at the protocol level.

use crate::{Envelope, NodeId};

/// Deliverable address for a peer, produced by [`Transport::resolve`].
///
/// The handle is deliberately opaque: the cluster driver routes by identifier,
/// while the asynchronous simulator maps it back onto a mailbox. Holding a
/// handle is no guarantee of delivery — the peer may become unreachable
/// between resolution and send, in which case the send is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    id: NodeId,
}

impl PeerHandle {
    /// Create a handle for a resolved peer.
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }

    /// Identifier of the peer this handle addresses.
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Message delivery capability injected into every [`crate::NodeActor`].
///
/// Implementations must be callable from whatever execution context drives the
/// node's handlers, hence `Send + Sync`. The two provided implementations are
/// the deterministic in-process queue in [`crate::cluster`] and the
/// latency-injecting tokio network in the simulation crate.
pub trait Transport: Send + Sync {
    /// Resolve a peer identifier to a deliverable handle, or `None` when the
    /// transport knows of no such peer.
    fn resolve(&self, peer: NodeId) -> Option<PeerHandle>;

    /// Fire-and-forget delivery of one envelope.
    ///
    /// May incur arbitrary delay and reorders freely against every other
    /// send. Failure is silent: there is no acknowledgement, timeout or retry.
    fn send(&self, handle: &PeerHandle, envelope: Envelope);
}
