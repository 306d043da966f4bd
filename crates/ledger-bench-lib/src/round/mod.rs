// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! One timed benchmark round: a load queue, a rate-controlled scheduler and
//! a results collector with its own statistics scope.

pub mod queue;

use crate::{
    config::RoundConfig,
    invoker::{unix_millis, TransactionInvoker},
    ledger::LedgerConnection,
    monitor::ResourceMonitor,
    stats::TxStats,
};
use anyhow::{bail, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};

pub use queue::{ArgTuple, LoadQueue};

/// Result of offering a candidate block to a round. Any rejection returns
/// the unconsumed tuples whole, so the caller can route them elsewhere.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Overflow(Vec<ArgTuple>),
}

impl AddOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AddOutcome::Accepted)
    }

    pub fn into_overflow(self) -> Vec<ArgTuple> {
        match self {
            AddOutcome::Accepted => Vec::new(),
            AddOutcome::Overflow(rest) => rest,
        }
    }
}

/// What a finished round hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub name: String,
    /// `None` when the round produced no results at all.
    pub stats: Option<TxStats>,
    pub sent: u64,
    pub added: u64,
    /// Queue entries discarded by the stop-time flush.
    pub discarded: usize,
    /// Milliseconds since epoch at which the stop fully completed. The next
    /// round never starts before this.
    pub stopped_at_ms: u64,
}

struct ResultSink {
    entries: Vec<crate::invoker::InvocationResult>,
    /// Set at stop; late dispatch results are dropped once the collection
    /// has been read for statistics.
    sealed: bool,
}

pub struct Round {
    config: RoundConfig,
    invoker: TransactionInvoker,
    monitor: Arc<dyn ResourceMonitor>,
    queue: Mutex<LoadQueue>,
    results: Mutex<ResultSink>,
    started: AtomicBool,
    stopped: AtomicBool,
    finished: watch::Sender<bool>,
    report: Mutex<Option<RoundReport>>,
}

impl Round {
    pub fn new(
        config: RoundConfig,
        connection: Arc<dyn LedgerConnection>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        let queue = LoadQueue::new(config.transactions_to_send);
        Self {
            config,
            invoker: TransactionInvoker::new(connection),
            monitor,
            queue: Mutex::new(queue),
            results: Mutex::new(ResultSink {
                entries: Vec::new(),
                sealed: false,
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finished,
            report: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> u64 {
        self.queue.lock().added()
    }

    pub fn sent(&self) -> u64 {
        self.queue.lock().sent()
    }

    /// Offers a candidate block. Tuples for other functions are dropped;
    /// matching tuples beyond the intake target come back as overflow. An
    /// empty batch or a stopped round rejects the whole batch.
    pub fn add_transactions(&self, block: Vec<ArgTuple>) -> AddOutcome {
        if block.is_empty() || self.is_stopped() {
            return AddOutcome::Overflow(block);
        }
        let function = self.config.function.as_str();
        let mut queue = self.queue.lock();
        let mut overflow = Vec::new();
        for tuple in block {
            if tuple.first().map(String::as_str) != Some(function) {
                continue;
            }
            if queue.has_capacity() {
                queue.push(tuple);
            } else {
                overflow.push(tuple);
            }
        }
        if overflow.is_empty() {
            AddOutcome::Accepted
        } else {
            AddOutcome::Overflow(overflow)
        }
    }

    /// Starts the scheduler and resolves once the round has fully stopped,
    /// either by reaching its target or through an external `stop`.
    pub async fn run(self: &Arc<Self>) -> Result<RoundReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("round {} already started", self.name());
        }
        if self.is_stopped() {
            // Stopped before it ever ran; a stopped round never restarts.
            return Ok(RoundReport {
                name: self.name().to_string(),
                stats: None,
                sent: 0,
                added: 0,
                discarded: 0,
                stopped_at_ms: unix_millis(),
            });
        }
        info!("Starting round: {}", self.name());
        if let Err(err) = self.monitor.start().await {
            warn!(
                "Resource monitor failed to start for round {}: {:#}",
                self.name(),
                err
            );
        }
        let mut finished = self.finished.subscribe();
        let round = Arc::clone(self);
        tokio::spawn(async move { round.schedule_loop().await });
        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                break;
            }
        }
        let report = self.report.lock().clone();
        Ok(report.unwrap_or_else(|| RoundReport {
            name: self.name().to_string(),
            stats: None,
            sent: 0,
            added: 0,
            discarded: 0,
            stopped_at_ms: unix_millis(),
        }))
    }

    async fn schedule_loop(self: Arc<Self>) {
        let period = Duration::from_secs_f64(1.0 / self.config.rate);
        // First tick only after one full period, like the queue processor
        // this paces against a fixed send rate from the start.
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_stopped() {
                return;
            }
            let next = {
                let mut queue = self.queue.lock();
                if queue.sent() >= queue.target() {
                    None
                } else {
                    // An empty queue makes this tick a no-op; the scheduler
                    // never manufactures work.
                    match queue.pop() {
                        Some(args) => Some(args),
                        None => continue,
                    }
                }
            };
            match next {
                Some(args) => {
                    let round = Arc::clone(&self);
                    // Fire and forget: the next tick never waits on this.
                    tokio::spawn(async move { round.dispatch(args).await });
                }
                None => {
                    self.stop().await;
                    return;
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, args: ArgTuple) {
        let timeout = Duration::from_secs(self.config.invoke_timeout_secs);
        let result = self
            .invoker
            .invoke(
                &self.config.contract_id,
                &self.config.contract_version,
                args,
                timeout,
            )
            .await;
        {
            let mut sink = self.results.lock();
            if !sink.sealed {
                sink.entries.push(result);
            }
        }
        self.queue.lock().mark_sent();
    }

    /// Terminal: the first caller cancels the scheduler, seals the results,
    /// flushes the queue and emits statistics. Later callers return
    /// immediately; a never-started round only gets marked stopped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.started.load(Ordering::SeqCst) {
            let _ = self.finished.send(true);
            return;
        }
        info!("Stopping round: {}", self.name());
        let discarded = self.queue.lock().drain();
        if discarded > 0 {
            debug!(
                "Discarded {} unsent queue entries in round {}",
                discarded,
                self.name()
            );
        }
        let entries = {
            let mut sink = self.results.lock();
            sink.sealed = true;
            std::mem::take(&mut sink.entries)
        };
        if let Err(err) = self.monitor.stop().await {
            warn!(
                "Resource monitor failed to stop for round {}: {:#}",
                self.name(),
                err
            );
        }
        self.log_resource_summary();
        let stats = (!entries.is_empty()).then(|| TxStats::from_results(&entries, true));
        match &stats {
            Some(stats) => info!("{}", stats.summary(self.name())),
            None => info!("Round {} produced no results", self.name()),
        }
        let (sent, added) = {
            let queue = self.queue.lock();
            (queue.sent(), queue.added())
        };
        info!("Amount of transactions sent in round {}: {}", self.name(), sent);
        *self.report.lock() = Some(RoundReport {
            name: self.name().to_string(),
            stats,
            sent,
            added,
            discarded,
            stopped_at_ms: unix_millis(),
        });
        let _ = self.finished.send(true);
    }

    /// Report of a finished round, `None` while it is still running.
    pub fn report(&self) -> Option<RoundReport> {
        self.report.lock().clone()
    }

    fn log_resource_summary(&self) {
        for peer in self.monitor.peers() {
            let mem = self.monitor.mem_history(&peer);
            let cpu = self.monitor.cpu_history(&peer);
            let net = self.monitor.network_history(&peer);
            if mem.is_empty() && cpu.is_empty() && net.is_empty() {
                continue;
            }
            let max_mem = mem.iter().copied().fold(0.0_f64, f64::max);
            let avg_cpu = if cpu.is_empty() {
                0.0
            } else {
                cpu.iter().sum::<f64>() / cpu.len() as f64
            };
            let (net_in, net_out) = net
                .iter()
                .fold((0.0, 0.0), |(i, o), (rx, tx)| (i + rx, o + tx));
            info!(
                "Round {} resources for {}: max mem {:.1} MB, avg cpu {:.1}%, net in/out {:.1}/{:.1} MB",
                self.name(),
                peer,
                max_mem,
                avg_cpu,
                net_in,
                net_out,
            );
        }
    }
}
