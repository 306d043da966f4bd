// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Benchmark orchestration: builds the round list from the configuration,
//! advances it strictly in sequence, routes observed candidate blocks to the
//! active round (cascading overflow forward) and fans the start signal out
//! to child load generators.

use crate::{
    config::BenchmarkConfig,
    ledger::{ChildNode, Ledger},
    monitor::MonitorProvider,
    round::{AddOutcome, ArgTuple, Round},
    stats::TxStats,
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Initializing,
    Busy { round: usize },
    Finished,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Initializing => write!(f, "initializing"),
            RunStatus::Busy { round } => write!(f, "busy (round {})", round),
            RunStatus::Finished => write!(f, "finished"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

pub struct Orchestrator {
    config: BenchmarkConfig,
    ledger: Arc<dyn Ledger>,
    monitors: Arc<dyn MonitorProvider>,
    children: Vec<Arc<dyn ChildNode>>,
    rounds: Mutex<Vec<Arc<Round>>>,
    /// Index of the currently active round. Only moves forward.
    cursor: AtomicUsize,
    observed: AtomicU64,
    status: Mutex<RunStatus>,
}

impl Orchestrator {
    pub fn new(
        config: BenchmarkConfig,
        ledger: Arc<dyn Ledger>,
        monitors: Arc<dyn MonitorProvider>,
        children: Vec<Arc<dyn ChildNode>>,
    ) -> Self {
        Self {
            config,
            ledger,
            monitors,
            children,
            rounds: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            observed: AtomicU64::new(0),
            status: Mutex::new(RunStatus::Idle),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    pub fn transactions_observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    /// Runs the whole benchmark: ledger setup, then every round in order.
    /// Returns the merged statistics, or `None` when no round produced any.
    /// Calling it on a non-idle orchestrator transitions nothing.
    pub async fn start(&self) -> Result<Option<TxStats>> {
        {
            let mut status = self.status.lock();
            if *status != RunStatus::Idle {
                info!("Ignoring start signal, orchestrator is {}", status);
                return Ok(None);
            }
            *status = RunStatus::Initializing;
        }
        match self.run_rounds().await {
            Ok(stats) => {
                *self.status.lock() = RunStatus::Finished;
                Ok(stats)
            }
            Err(err) => {
                *self.status.lock() = RunStatus::Error;
                Err(err)
            }
        }
    }

    async fn run_rounds(&self) -> Result<Option<TxStats>> {
        self.ledger.init().await.context("ledger setup failed")?;
        self.ledger
            .install_contract()
            .await
            .context("contract installation failed")?;

        let mut rounds = Vec::with_capacity(self.config.rounds.len());
        for round_config in &self.config.rounds {
            let connection = self
                .ledger
                .connect(&round_config.name)
                .await
                .with_context(|| {
                    format!("failed to build a ledger context for round {}", round_config.name)
                })?;
            rounds.push(Arc::new(Round::new(
                round_config.clone(),
                connection,
                self.monitors.monitor_for(&round_config.name),
            )));
        }
        *self.rounds.lock() = rounds.clone();

        self.signal_children();

        let mut reports = Vec::with_capacity(rounds.len());
        for (index, round) in rounds.iter().enumerate() {
            if round.is_stopped() {
                // The benchmark was stopped externally; later rounds were
                // never started and stay that way.
                info!("Skipping round {}, benchmark was stopped", round.name());
                break;
            }
            self.cursor.store(index, Ordering::SeqCst);
            *self.status.lock() = RunStatus::Busy { round: index };
            let report = round.run().await?;
            info!(
                "Amount of transactions observed so far: {}",
                self.transactions_observed()
            );
            reports.push(report);
        }
        Ok(TxStats::merge(
            reports.into_iter().filter_map(|report| report.stats),
        ))
    }

    /// One-way start triggers; children report back through the block
    /// endpoint on their own, there is no join.
    fn signal_children(&self) {
        for child in &self.children {
            let child = Arc::clone(child);
            tokio::spawn(async move {
                info!("Signaling child {} to start", child.name());
                if let Err(err) = child.signal_start().await {
                    warn!("Failed to signal child {}: {:#}", child.name(), err);
                }
            });
        }
    }

    /// Routes a block of observed candidate transactions to the active
    /// round; overflow cascades forward round by round until absorbed or
    /// the list runs out.
    pub fn handle_block(&self, block: Vec<ArgTuple>) {
        self.observed
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        let rounds = self.rounds.lock().clone();
        if rounds.is_empty() {
            debug!(
                "Dropping a block of {} candidates, no rounds are built yet",
                block.len()
            );
            return;
        }
        let mut index = self.cursor.load(Ordering::SeqCst);
        let mut batch = block;
        while index < rounds.len() {
            batch = match rounds[index].add_transactions(batch) {
                AddOutcome::Accepted => return,
                AddOutcome::Overflow(rest) => rest,
            };
            if batch.is_empty() {
                return;
            }
            index += 1;
            if index < rounds.len() {
                debug!(
                    "Round {} overflowed, forwarding {} candidates to round {}",
                    rounds[index - 1].name(),
                    batch.len(),
                    rounds[index].name()
                );
            }
        }
        debug!(
            "Dropping {} candidates, no round left to absorb them",
            batch.len()
        );
    }

    /// Stops every round. Idempotent; rounds that never started are only
    /// marked stopped.
    pub async fn stop(&self) {
        let rounds = self.rounds.lock().clone();
        for round in rounds {
            round.stop().await;
        }
    }
}
