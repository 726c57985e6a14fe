//! GradSync worker binary.
//!
//! ```bash
//! # Show the role flags and itineraries this node would run with
//! RUST_LOG=info cargo run --bin gradsync-node -- topology
//!
//! # Drive a loopback end-to-end push+pull round and report timing
//! RUST_LOG=info cargo run --bin gradsync-node -- smoke --size-kb 256
//! ```
//!
//! The topology is read from `GRADSYNC_*` environment variables; unset
//! variables fall back to a single-worker, single-device layout.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gradsync_engine::{loopback_capabilities, Engine, StatusCallback};
use gradsync_engine::loopback::VecTensor;
use gradsync_types::config::TopologyConfig;
use gradsync_types::dtype::TensorDtype;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "gradsync-node",
    version = env!("CARGO_PKG_VERSION"),
    about = "GradSync — distributed gradient synchronization"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the role flags and stage itineraries for this topology.
    Topology,

    /// Run a loopback push+pull round through the full pipeline.
    Smoke {
        /// Tensor size in KiB.
        #[arg(long, default_value_t = 256)]
        size_kb: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let topology = TopologyConfig::from_env();

    match cli.command {
        Command::Topology => run_topology(topology),
        Command::Smoke { size_kb } => run_smoke(topology, size_kb),
    }
}

// ── Topology mode ─────────────────────────────────────────────────────────────

fn run_topology(topology: TopologyConfig) -> Result<()> {
    let (caps, _ps, _coord) = loopback_capabilities(true, topology.num_pcie_switches);
    let engine = Engine::init(topology, caps)?;

    println!("rank {} of {}", engine.rank(), engine.size());
    println!("local rank {} of {}", engine.local_rank(), engine.local_size());
    println!("role: {:?}", engine.role());
    println!("push itinerary: {:?}", engine.push_queue_list(0));
    println!("pull itinerary: {:?}", engine.pull_queue_list(0));

    engine.shutdown();
    Ok(())
}

// ── Smoke mode ────────────────────────────────────────────────────────────────

fn run_smoke(mut topology: TopologyConfig, size_kb: usize) -> Result<()> {
    // The round trip must cross the parameter server, which only the root
    // device of a distributed worker does.
    if !topology.is_distributed() {
        info!("single-worker topology; running the smoke round as a two-worker root");
        topology.num_workers = 2;
    }
    topology.local_rank = 0;

    let size = size_kb * 1024;
    let (caps, ps, _coord) = loopback_capabilities(true, topology.num_pcie_switches);
    let engine = Engine::init(topology, caps)?;

    let ctx = engine.get_or_register("smoke.grad", size)?;
    engine.init_tensor(&ctx, TensorDtype::F32, None)?;
    info!(
        size,
        parts = ctx.key_list().len(),
        "tensor registered and initialized"
    );

    let elements = size / 4;
    let input = Arc::new(VecTensor::from_f32(&vec![1.0f32; elements]));
    let output = Arc::new(VecTensor::from_f32(&vec![0.0f32; elements]));

    let start = Instant::now();

    let (cb, rx) = callback_channel();
    engine.enqueue_tensor(
        Arc::clone(&ctx),
        Some(Arc::clone(&input) as _),
        Some(Arc::clone(&input) as _),
        None,
        0,
        0,
        1,
        cb,
        engine.push_queue_list(0),
    )?;
    rx.recv().context("push round dropped its callback")??;
    info!(elapsed = ?start.elapsed(), pushes = ps.push_count(), "push round complete");

    let (cb, rx) = callback_channel();
    engine.enqueue_tensor(
        Arc::clone(&ctx),
        None,
        Some(Arc::clone(&output) as _),
        None,
        0,
        0,
        2,
        cb,
        engine.pull_queue_list(0),
    )?;
    rx.recv().context("pull round dropped its callback")??;
    info!(elapsed = ?start.elapsed(), pulls = ps.pull_count(), "pull round complete");

    let restored = output.to_f32();
    anyhow::ensure!(
        restored.iter().all(|&v| v == 1.0),
        "pulled values do not match pushed values"
    );
    info!(elements, "loopback round trip verified");

    engine.shutdown();
    Ok(())
}

fn callback_channel() -> (StatusCallback, mpsc::Receiver<gradsync_engine::Status>) {
    let (tx, rx) = mpsc::channel();
    let cb: StatusCallback = Arc::new(move |status| {
        let _ = tx.send(status);
    });
    (cb, rx)
}
