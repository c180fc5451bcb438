//! Drives a full protocol run over the asynchronous network.
//!
//! One tokio task per node owns that node's [`NodeActor`] and drains its
//! mailbox, which serializes handler invocations the way the protocol
//! requires. Wake-ups are injected with independent random jitter, so nodes
//! start in arbitrary order relative to the first incoming messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info};

use spantree_protocol::{NodeActor, ProtocolError, Topology, Transport};

use crate::net::{NodeInput, SimNetwork};
use crate::report::MstReport;
use crate::SimError;

/// Tunables of one simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Upper bound of the uniform per-message delivery delay.
    pub max_delay: Duration,
    /// Upper bound of the uniform spontaneous-wake jitter.
    pub wake_jitter: Duration,
    /// Seed for delays and jitter; equal seeds reproduce a schedule.
    pub seed: u64,
    /// How long to wait for the network to go quiet before giving up.
    pub quiescence_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(150),
            wake_jitter: Duration::from_millis(1000),
            seed: 0,
            quiescence_timeout: Duration::from_secs(30),
        }
    }
}

/// Run the protocol over `topology` to quiescence and report the resulting
/// spanning tree.
pub async fn run(topology: &Topology, config: SimConfig) -> Result<MstReport, SimError> {
    if !topology.is_connected() {
        return Err(SimError::Disconnected);
    }
    info!(
        nodes = topology.node_count(),
        edges = topology.edges().len(),
        seed = config.seed,
        "starting simulation"
    );

    let net = Arc::new(SimNetwork::new(config.max_delay, config.seed));
    let mut receivers = HashMap::new();
    for id in topology.nodes() {
        let (tx, rx) = mpsc::unbounded_channel();
        net.register(id, tx);
        receivers.insert(id, rx);
    }

    let mut workers = Vec::new();
    for id in topology.nodes() {
        let actor = NodeActor::new(
            id,
            topology.incident_edges(id),
            Arc::clone(&net) as Arc<dyn Transport>,
        )?;
        let Some(mut mailbox) = receivers.remove(&id) else {
            continue;
        };
        let net = Arc::clone(&net);
        workers.push(tokio::spawn(async move {
            let mut actor = actor;
            let mut handled = 0usize;
            while let Some(input) = mailbox.recv().await {
                let result = match input {
                    NodeInput::Wake => actor.wake(),
                    NodeInput::Message(envelope) => {
                        handled += 1;
                        actor.handle(envelope.from, envelope.message)
                    }
                };
                net.complete_delivery();
                result?;
            }
            debug!(node = actor.id(), handled, "worker finished");
            Ok::<(NodeActor, usize), ProtocolError>((actor, handled))
        }));
    }

    // arbitrary start-up order: every node wakes on its own schedule, and a
    // message arriving first wakes the receiver just as well
    let mut jitter = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let jitter_cap = config.wake_jitter.as_millis() as u64;
    for id in topology.nodes() {
        let delay = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(jitter.gen_range(0..=jitter_cap))
        };
        net.inject_wake(id, delay);
    }

    tokio::time::timeout(config.quiescence_timeout, net.quiescent())
        .await
        .map_err(|_| SimError::QuiescenceTimeout(config.quiescence_timeout))?;
    net.shutdown();

    let mut actors = Vec::new();
    let mut delivered = 0usize;
    for worker in workers {
        let (actor, handled) = worker.await??;
        delivered += handled;
        actors.push(actor);
    }
    actors.sort_by_key(NodeActor::id);

    let report = MstReport::build(topology, &actors, delivered);
    info!(
        edges = report.edges.len(),
        total_cost = report.total_cost,
        delivered,
        "simulation quiescent"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spantree_protocol::properties;

    fn config() -> SimConfig {
        SimConfig {
            quiescence_timeout: Duration::from_secs(600),
            ..SimConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn triangle_converges_to_the_reference_mst() {
        let topology = Topology::from_edges([(0, 1, 1), (1, 2, 2), (0, 2, 3)]).unwrap();
        let report = run(&topology, config()).await.unwrap();
        assert!(report.is_spanning_tree);
        assert!(report.matches_reference);
        assert_eq!(report.total_cost, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_change_the_schedule_but_not_the_tree() {
        let topology = Topology::from_edges([
            (0, 1, 4),
            (1, 2, 8),
            (2, 3, 7),
            (3, 4, 9),
            (0, 4, 11),
            (1, 4, 8),
            (2, 4, 2),
        ])
        .unwrap();
        let expected = properties::total_cost(&properties::reference_mst(&topology));
        for seed in [0, 1, 42, 1337] {
            let report = run(
                &topology,
                SimConfig {
                    seed,
                    ..config()
                },
            )
            .await
            .unwrap();
            assert!(report.matches_reference, "seed {seed}");
            assert_eq!(report.total_cost, expected, "seed {seed}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_topologies_are_rejected() {
        let topology = Topology::from_edges([(0, 1, 1), (2, 3, 2)]).unwrap();
        assert!(matches!(
            run(&topology, config()).await,
            Err(SimError::Disconnected)
        ));
    }
}
