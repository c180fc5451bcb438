//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::collections::BTreeSet;

use spantree_protocol::{properties, Cluster, DeliveryOrder, Edge, ProtocolResult, Topology};

/// Generous ceiling: a hang shows up as a `NoQuiescence` error, not a stuck
/// test run.
pub const DELIVERY_BUDGET: usize = 200_000;

/// Wake every node and deliver to quiescence, returning the agreed tree.
pub fn run_to_mst(topology: &Topology, order: DeliveryOrder) -> ProtocolResult<BTreeSet<Edge>> {
    let mut cluster = Cluster::new(topology, order)?;
    cluster.wake_all()?;
    cluster.run_to_quiescence(DELIVERY_BUDGET)?;
    Ok(cluster.branch_edges())
}

/// Run under `order` and compare against the sequential Kruskal reference.
pub fn assert_matches_reference(topology: &Topology, order: DeliveryOrder) {
    let agreed = run_to_mst(topology, order).expect("protocol run failed");
    assert_eq!(
        agreed,
        properties::reference_mst(topology),
        "wrong tree under {order:?}"
    );
}

/// The delivery orders every scenario is exercised under.
pub fn all_orders() -> Vec<DeliveryOrder> {
    vec![
        DeliveryOrder::Fifo,
        DeliveryOrder::Lifo,
        DeliveryOrder::Shuffled(0),
        DeliveryOrder::Shuffled(7),
        DeliveryOrder::Shuffled(0xFEED),
    ]
}

/// Eight nodes with redundant edges and repeated raw costs.
pub fn mesh() -> Topology {
    Topology::from_edges([
        (0, 1, 4),
        (0, 7, 8),
        (1, 7, 11),
        (1, 2, 8),
        (7, 6, 1),
        (7, 5, 7),
        (2, 3, 7),
        (2, 5, 4),
        (6, 5, 2),
        (3, 5, 14),
        (3, 4, 9),
        (5, 4, 10),
    ])
    .expect("valid topology")
}
