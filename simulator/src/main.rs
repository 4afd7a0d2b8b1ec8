//! Latchkey Simulator
//!
//! Runs contention scenarios against an in-process store and checks that
//! the locks and rate limiters keep their guarantees.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// Latchkey Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Contention scenarios for latchkey locks and rate limiters")]
struct Args {
    /// Scenario to run (all scenarios when omitted)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Print the available scenarios as JSON and exit
    #[arg(long)]
    list: bool,

    /// Number of concurrent workers, each with its own client
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Operations per worker
    #[arg(short, long, default_value = "20")]
    rounds: u32,

    /// Simulated store round-trip latency in milliseconds
    #[arg(long, default_value = "1")]
    store_latency_ms: u64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print the scenario reports as JSON when done
    #[arg(long)]
    report: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if args.list {
        println!("{}", serde_json::to_string_pretty(&Scenario::all())?);
        return Ok(());
    }

    let scenarios = match &args.scenario {
        Some(name) => vec![Scenario::load(name)?],
        None => Scenario::all(),
    };

    info!("Starting Latchkey Simulator");
    info!("Workers: {}", args.workers);
    info!("Rounds: {}", args.rounds);

    let controller = SimulationController::new(
        args.workers,
        args.rounds,
        Duration::from_millis(args.store_latency_ms),
        args.seed,
    );

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in &scenarios {
        reports.push(controller.run_scenario(scenario).await?);
    }

    info!("Simulation complete: {} scenarios passed", reports.len());

    if args.report {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    Ok(())
}
