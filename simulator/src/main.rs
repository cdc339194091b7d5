//! NR Random Access Simulator
//!
//! Runs contending terminals against one simulated cell in virtual time and
//! reports random access outcomes and resource usage.

mod config;
mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::SimConfig;
use simulation::Simulation;

/// NR random access simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML or TOML scenario; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the scenario
    #[arg(short, long)]
    log_level: Option<String>,

    /// Random seed, overrides the scenario
    #[arg(long)]
    seed: Option<u64>,

    /// Number of terminals, overrides the scenario
    #[arg(long)]
    num_ues: Option<usize>,

    /// Simulated duration in milliseconds, overrides the scenario
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Write the final report as JSON
    #[arg(long)]
    stats_out: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path).with_context(|| format!("loading scenario {}", path))?,
        None => SimConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(num_ues) = args.num_ues {
        config.simulation.num_ues = num_ues;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.simulation.duration_ms = duration_ms;
    }

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting NR random access simulator");
    info!(
        "Cell {}: {} kHz, {} RBs, TDD {}, PRACH index {}",
        config.cell.cell_id,
        config.cell.common_scs,
        config.cell.carrier_rbs,
        config.cell.tdd_pattern,
        config.prach.rach.prach_config_index
    );

    let stop = Arc::new(AtomicBool::new(false));
    let mut sim_handle = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || -> Result<simulation::SimulationReport> {
            let simulation = Simulation::new(config)?;
            Ok(simulation.run(&stop))
        })
    };

    // Run to completion unless interrupted
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        joined = &mut sim_handle => Some(joined),
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            info!("Received shutdown signal");
            stop.store(true, Ordering::Relaxed);
            sim_handle.await
        }
    };

    let report = match joined {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            error!("Simulation setup failed: {:#}", e);
            return Err(e);
        }
        Err(e) => {
            error!("Simulation task failed: {}", e);
            return Err(e.into());
        }
    };

    info!("Simulation Report:");
    info!("  Slots: {}, terminals: {}", report.slots, report.terminals);
    info!(
        "  Succeeded: {}, failed: {}, unfinished: {}",
        report.succeeded, report.failed, report.unfinished
    );
    info!(
        "  Preambles sent: {}, lost: {}, mean transmissions: {:.2}, mean access delay: {:.2} ms",
        report.preambles_sent, report.preambles_lost, report.mean_transmissions, report.mean_access_delay_ms
    );
    info!(
        "  PRACH: {} received on {} occasions, {} collisions, {} exhausted",
        report.prach.preambles_received, report.prach.occasions_used, report.prach.collisions, report.prach.exhausted
    );
    info!(
        "  PDCCH: {} allocated, {} blocked",
        report.pdcch_allocated, report.pdcch_blocked
    );
    info!(
        "  Capacity usage: {:.1}% downlink, {:.1}% uplink",
        report.capacity_usage_dl * 100.0,
        report.capacity_usage_ul * 100.0
    );
    if report.unfinished > 0 {
        warn!("{} terminals still in random access at the end", report.unfinished);
    }

    if let Some(path) = &args.stats_out {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing report to {}", path))?;
        info!("Report written to {}", path);
    }

    info!("Simulator shutdown complete");
    Ok(())
}
