// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-process ledger backend. Endorses, orders and commits after simulated
//! delays, with an optional invalid-commit ratio. This is the backend the
//! CLI drives for local smoke runs and the integration tests reuse; it
//! exercises the full outcome protocol without any network.

use crate::ledger::{
    CommitStatus, CommitStream, Envelope, Ledger, LedgerConnection, LedgerError, OrderingAck,
    ProposalRequest, ProposalResponse, TxId,
};
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub endorsers: usize,
    pub event_channels: usize,
    pub endorse_delay: Duration,
    pub order_delay: Duration,
    pub commit_delay: Duration,
    /// Fraction of transactions committed as invalid, 0.0..=1.0.
    pub invalid_commit_ratio: f64,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            endorsers: 2,
            event_channels: 2,
            endorse_delay: Duration::from_millis(2),
            order_delay: Duration::from_millis(2),
            commit_delay: Duration::from_millis(50),
            invalid_commit_ratio: 0.0,
        }
    }
}

pub struct LoopbackLedger {
    options: LoopbackOptions,
}

impl LoopbackLedger {
    pub fn new(options: LoopbackOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Ledger for LoopbackLedger {
    async fn init(&self) -> Result<()> {
        debug!("Loopback ledger ready, nothing to bootstrap");
        Ok(())
    }

    async fn install_contract(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, round_name: &str) -> Result<Arc<dyn LedgerConnection>> {
        Ok(Arc::new(LoopbackConnection::new(
            self.options.clone(),
            round_name,
        )))
    }
}

/// Commit notifications shared between a connection and its event streams.
struct CommitBoard {
    commits: Mutex<HashMap<TxId, CommitStatus>>,
    version: watch::Sender<u64>,
}

impl CommitBoard {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            commits: Mutex::new(HashMap::new()),
            version,
        }
    }

    fn publish(&self, tx_id: TxId, status: CommitStatus) {
        self.commits.lock().insert(tx_id, status);
        self.version.send_modify(|v| *v += 1);
    }
}

pub struct LoopbackConnection {
    options: LoopbackOptions,
    label: String,
    next_id: AtomicU64,
    board: Arc<CommitBoard>,
}

impl LoopbackConnection {
    pub fn new(options: LoopbackOptions, label: &str) -> Self {
        Self {
            options,
            label: label.to_string(),
            next_id: AtomicU64::new(0),
            board: Arc::new(CommitBoard::new()),
        }
    }
}

#[async_trait]
impl LedgerConnection for LoopbackConnection {
    fn new_transaction_id(&self) -> TxId {
        format!(
            "{}-{:06}",
            self.label,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn send_proposal(
        &self,
        request: &ProposalRequest,
        timeout: Duration,
    ) -> Result<Vec<ProposalResponse>, LedgerError> {
        if self.options.endorse_delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(LedgerError::Timeout(timeout));
        }
        tokio::time::sleep(self.options.endorse_delay).await;
        // Every endorser executes the same call, so the simulated footprint
        // agrees by construction.
        let payload = format!("{}({})", request.function, request.args.join(",")).into_bytes();
        Ok((0..self.options.endorsers)
            .map(|i| ProposalResponse {
                peer: format!("peer{}", i),
                status: 200,
                payload: payload.clone(),
                read_write_set: payload.clone(),
            })
            .collect())
    }

    async fn broadcast(
        &self,
        envelope: Envelope,
        _timeout: Duration,
    ) -> Result<OrderingAck, LedgerError> {
        tokio::time::sleep(self.options.order_delay).await;
        let invalid = self.options.invalid_commit_ratio > 0.0
            && rand::thread_rng().gen::<f64>() < self.options.invalid_commit_ratio;
        let status = if invalid {
            CommitStatus::Invalid("ENDORSEMENT_POLICY_FAILURE".to_string())
        } else {
            CommitStatus::Valid
        };
        let board = Arc::clone(&self.board);
        let commit_delay = self.options.commit_delay;
        let tx_id = envelope.proposal.tx_id;
        tokio::spawn(async move {
            tokio::time::sleep(commit_delay).await;
            board.publish(tx_id, status);
        });
        Ok(OrderingAck::Success)
    }

    fn commit_streams(&self) -> Vec<Arc<dyn CommitStream>> {
        (0..self.options.event_channels)
            .map(|_| {
                Arc::new(LoopbackStream {
                    board: Arc::clone(&self.board),
                }) as Arc<dyn CommitStream>
            })
            .collect()
    }
}

struct LoopbackStream {
    board: Arc<CommitBoard>,
}

#[async_trait]
impl CommitStream for LoopbackStream {
    async fn wait_commit(&self, tx_id: &str) -> Result<CommitStatus, LedgerError> {
        let mut version = self.board.version.subscribe();
        loop {
            if let Some(status) = self.board.commits.lock().get(tx_id).cloned() {
                return Ok(status);
            }
            version
                .changed()
                .await
                .map_err(|_| LedgerError::ChannelClosed("commit board dropped".to_string()))?;
        }
    }
}
