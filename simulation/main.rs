//! `spantree-sim`: run the protocol over a TOML topology and print the tree.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use spantree_sim::{run, TopologySpec};

#[derive(Debug, Parser)]
#[command(
    name = "spantree-sim",
    about = "Distributed minimum-spanning-tree construction over a simulated network"
)]
struct Args {
    /// Topology file (TOML)
    topology: PathBuf,

    /// Override the RNG seed from the topology file
    #[arg(long)]
    seed: Option<u64>,

    /// Override the maximum per-message delay, in milliseconds
    #[arg(long)]
    max_delay_ms: Option<u64>,

    /// Emit the report as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let raw = fs::read_to_string(&args.topology)
        .with_context(|| format!("reading {}", args.topology.display()))?;
    let spec = TopologySpec::parse(&raw)?;
    let topology = spec.to_topology()?;

    let mut config = spec.sim_config();
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_delay_ms) = args.max_delay_ms {
        config.max_delay = std::time::Duration::from_millis(max_delay_ms);
    }

    let report = run(&topology, config).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}
