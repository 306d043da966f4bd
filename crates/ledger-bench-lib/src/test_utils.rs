// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Scriptable ledger doubles for phase-level protocol tests.

use crate::ledger::{
    CommitStatus, Envelope, Ledger, LedgerConnection, LedgerError, OrderingAck, ProposalRequest,
    ProposalResponse, TxId,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Debug, Clone)]
pub(crate) enum ProposalPlan {
    Endorse,
    TransportError,
    Denied { status: u16 },
    Diverging,
}

#[derive(Debug, Clone)]
pub(crate) enum BroadcastPlan {
    Ack,
    Rejected(String),
    TransportError,
}

#[derive(Debug, Clone)]
pub(crate) enum ChannelPlan {
    Valid { delay: Duration },
    Invalid { code: String, delay: Duration },
    Error,
    Never,
}

pub(crate) struct ScriptedConnection {
    pub proposal: ProposalPlan,
    pub broadcast: BroadcastPlan,
    pub channels: Vec<ChannelPlan>,
    pub next_id: AtomicU64,
}

impl ScriptedConnection {
    /// Endorses, orders and promptly commits on `channels` event channels.
    pub fn healthy(channels: usize) -> Self {
        Self {
            proposal: ProposalPlan::Endorse,
            broadcast: BroadcastPlan::Ack,
            channels: (0..channels)
                .map(|_| ChannelPlan::Valid {
                    delay: Duration::from_millis(1),
                })
                .collect(),
            next_id: AtomicU64::new(0),
        }
    }

    fn response(peer: &str, status: u16, footprint: &[u8]) -> ProposalResponse {
        ProposalResponse {
            peer: peer.to_string(),
            status,
            payload: b"ok".to_vec(),
            read_write_set: footprint.to_vec(),
        }
    }
}

#[async_trait]
impl LedgerConnection for ScriptedConnection {
    fn new_transaction_id(&self) -> TxId {
        format!("tx-{:04}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_proposal(
        &self,
        _request: &ProposalRequest,
        _timeout: Duration,
    ) -> Result<Vec<ProposalResponse>, LedgerError> {
        match &self.proposal {
            ProposalPlan::Endorse => Ok(vec![
                Self::response("peer0", 200, b"rw"),
                Self::response("peer1", 200, b"rw"),
            ]),
            ProposalPlan::TransportError => {
                Err(LedgerError::Transport("connection refused".to_string()))
            }
            ProposalPlan::Denied { status } => Ok(vec![
                Self::response("peer0", 200, b"rw"),
                Self::response("peer1", *status, b"rw"),
            ]),
            ProposalPlan::Diverging => Ok(vec![
                Self::response("peer0", 200, b"rw-a"),
                Self::response("peer1", 200, b"rw-b"),
            ]),
        }
    }

    async fn broadcast(
        &self,
        _envelope: Envelope,
        _timeout: Duration,
    ) -> Result<OrderingAck, LedgerError> {
        match &self.broadcast {
            BroadcastPlan::Ack => Ok(OrderingAck::Success),
            BroadcastPlan::Rejected(code) => Ok(OrderingAck::Rejected(code.clone())),
            BroadcastPlan::TransportError => {
                Err(LedgerError::Transport("broadcast stream reset".to_string()))
            }
        }
    }

    fn commit_streams(&self) -> Vec<Arc<dyn crate::ledger::CommitStream>> {
        self.channels
            .iter()
            .cloned()
            .map(|plan| Arc::new(ScriptedStream { plan }) as Arc<dyn crate::ledger::CommitStream>)
            .collect()
    }
}

struct ScriptedStream {
    plan: ChannelPlan,
}

#[async_trait]
impl crate::ledger::CommitStream for ScriptedStream {
    async fn wait_commit(&self, _tx_id: &str) -> Result<CommitStatus, LedgerError> {
        match &self.plan {
            ChannelPlan::Valid { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(CommitStatus::Valid)
            }
            ChannelPlan::Invalid { code, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(CommitStatus::Invalid(code.clone()))
            }
            ChannelPlan::Error => Err(LedgerError::ChannelClosed(
                "event hub disconnected".to_string(),
            )),
            ChannelPlan::Never => {
                // Outlives any invocation deadline; the caller's timer fires.
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(LedgerError::ChannelClosed("gave up".to_string()))
            }
        }
    }
}

/// Ledger double handing every round a healthy scripted connection.
pub(crate) struct ScriptedLedger {
    fail_setup: bool,
}

impl ScriptedLedger {
    pub fn healthy() -> Self {
        Self { fail_setup: false }
    }

    pub fn failing_setup() -> Self {
        Self { fail_setup: true }
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn init(&self) -> Result<()> {
        if self.fail_setup {
            bail!("orderer endpoint unreachable");
        }
        Ok(())
    }

    async fn install_contract(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, _round_name: &str) -> Result<Arc<dyn LedgerConnection>> {
        Ok(Arc::new(ScriptedConnection::healthy(2)))
    }
}
