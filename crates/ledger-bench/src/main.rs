// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Runs a configured benchmark against the in-process loopback backend,
//! synthesizing the candidate blocks a live deployment would observe from
//! the chain. Remote block/start transports are wired up by the embedding
//! service, not this binary.

use anyhow::Result;
use clap::Parser;
use ledger_bench_lib::{
    BenchmarkConfig, LoopbackLedger, LoopbackOptions, NullMonitorProvider, Orchestrator, RunStatus,
};
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Parser, Debug)]
#[clap(
    name = "ledger-bench",
    about = "Rate-controlled benchmark harness for endorse/order/commit ledgers"
)]
struct Args {
    /// Benchmark configuration file (ordered round list).
    #[clap(long, default_value = "benchmark.json")]
    config: PathBuf,

    /// Endorsing peers simulated by the loopback backend.
    #[clap(long, default_value_t = 2)]
    endorsers: usize,

    /// Commit event channels per connection.
    #[clap(long, default_value_t = 2)]
    event_channels: usize,

    /// Simulated ordering-to-commit delay in milliseconds.
    #[clap(long, default_value_t = 50)]
    commit_delay_ms: u64,

    /// Fraction of transactions committed as invalid, 0.0..=1.0.
    #[clap(long, default_value_t = 0.0)]
    invalid_commit_ratio: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = BenchmarkConfig::load(&args.config)?;

    let options = LoopbackOptions {
        endorsers: args.endorsers,
        event_channels: args.event_channels,
        commit_delay: Duration::from_millis(args.commit_delay_ms),
        invalid_commit_ratio: args.invalid_commit_ratio,
        ..LoopbackOptions::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(LoopbackLedger::new(options)),
        Arc::new(NullMonitorProvider),
        Vec::new(),
    ));

    let feeder = tokio::spawn(feed_candidates(Arc::clone(&orchestrator), config));
    let stats = orchestrator.start().await?;
    feeder.abort();

    match stats {
        Some(stats) => info!("{}", stats.summary("benchmark")),
        None => warn!("Benchmark produced no statistics"),
    }
    info!(
        "Amount of transactions observed: {}",
        orchestrator.transactions_observed()
    );
    Ok(())
}

/// Generates candidate blocks for whichever round is currently accepting
/// work, up to each round's own target.
async fn feed_candidates(orchestrator: Arc<Orchestrator>, config: BenchmarkConfig) {
    let mut fed: Vec<u64> = vec![0; config.rounds.len()];
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        match orchestrator.status() {
            RunStatus::Busy { round } => {
                let round_config = &config.rounds[round];
                if fed[round] >= round_config.transactions_to_send {
                    continue;
                }
                let chunk = (round_config.transactions_to_send - fed[round]).min(200);
                let block = (0..chunk)
                    .map(|i| {
                        vec![
                            round_config.function.clone(),
                            format!("acct-{}-{}", round, fed[round] + i),
                            "1".to_string(),
                        ]
                    })
                    .collect();
                orchestrator.handle_block(block);
                fed[round] += chunk;
            }
            RunStatus::Finished | RunStatus::Error => return,
            RunStatus::Idle | RunStatus::Initializing => {}
        }
    }
}
