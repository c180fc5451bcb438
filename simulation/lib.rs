//! Asynchronous simulation harness for the spantree protocol.
//!
//! The protocol core treats the network as an external collaborator behind
//! the [`spantree_protocol::Transport`] contract. This crate supplies that
//! collaborator: a tokio-based network that delivers every message through
//! its own delayed task (so ordering is arbitrary even between one pair of
//! nodes), one worker task per node to serialize handler invocations,
//! jittered spontaneous wake-up, quiescence detection, and a report of the
//! spanning tree the run converged on.
//!
//! Topologies are described in TOML:
//!
//! ```toml
//! [[edge]]
//! a = 0
//! b = 1
//! cost = 4
//!
//! [simulation]
//! max_delay_ms = 150
//! ```
//!
//! The `spantree-sim` binary loads such a file, runs the network to
//! quiescence and prints the resulting tree as text or JSON.

pub mod net;
pub mod report;
pub mod runner;
pub mod topology;

pub use net::SimNetwork;
pub use report::{MstReport, ReportEdge};
pub use runner::{run, SimConfig};
pub use topology::{EdgeSpec, SimSettings, TopologySpec};

use spantree_protocol::ProtocolError;

/// Errors of the simulation layer.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// The protocol core reported a fatal error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The topology file could not be parsed.
    #[error("invalid topology file: {0}")]
    InvalidTopology(#[from] toml::de::Error),

    /// The topology is disconnected and can never converge to one fragment.
    #[error("topology is not connected")]
    Disconnected,

    /// The network failed to quiesce within the configured timeout.
    #[error("simulation did not quiesce within {0:?}")]
    QuiescenceTimeout(std::time::Duration),

    /// A node worker task panicked or was cancelled.
    #[error("node task failed: {0}")]
    NodeTask(#[from] tokio::task::JoinError),
}
