//! TOML topology files.

use std::time::Duration;

use serde::Deserialize;

use spantree_protocol::{NodeId, ProtocolResult, Topology};

use crate::runner::SimConfig;
use crate::SimError;

/// One edge declaration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeSpec {
    /// First endpoint.
    pub a: NodeId,
    /// Second endpoint.
    pub b: NodeId,
    /// Raw edge cost; costs may repeat, the protocol's weights stay unique.
    pub cost: u64,
}

/// The `[simulation]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimSettings {
    /// Upper bound of the uniform per-message delivery delay.
    pub max_delay_ms: u64,
    /// Upper bound of the uniform spontaneous-wake jitter.
    pub wake_jitter_ms: u64,
    /// RNG seed for delays and jitter.
    pub seed: u64,
    /// Give up when the network has not gone quiet after this long.
    pub quiescence_timeout_ms: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            max_delay_ms: 150,
            wake_jitter_ms: 1000,
            seed: 0,
            quiescence_timeout_ms: 30_000,
        }
    }
}

/// A parsed topology file: edges plus optional simulation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologySpec {
    /// Declared edges.
    #[serde(rename = "edge")]
    pub edges: Vec<EdgeSpec>,
    /// Simulation tunables.
    #[serde(default)]
    pub simulation: SimSettings,
}

impl TopologySpec {
    /// Parse a TOML document.
    pub fn parse(input: &str) -> Result<Self, SimError> {
        Ok(toml::from_str(input)?)
    }

    /// Validate the declared edges into a protocol topology.
    pub fn to_topology(&self) -> ProtocolResult<Topology> {
        Topology::from_edges(self.edges.iter().map(|e| (e.a, e.b, e.cost)))
    }

    /// The run configuration the `[simulation]` table describes.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            max_delay: Duration::from_millis(self.simulation.max_delay_ms),
            wake_jitter: Duration::from_millis(self.simulation.wake_jitter_ms),
            seed: self.simulation.seed,
            quiescence_timeout: Duration::from_millis(self.simulation.quiescence_timeout_ms),
        }
    }
}
