// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Interfaces of the ledger backend under test. The harness only consumes
//! these capabilities; concrete transports live behind the trait objects.

use anyhow::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Opaque transaction identifier handed out by the backend.
pub type TxId = String;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("event channel closed: {0}")]
    ChannelClosed(String),
}

#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub contract_id: String,
    pub contract_version: String,
    pub function: String,
    pub args: Vec<String>,
    pub tx_id: TxId,
}

/// A single peer's endorsement of a proposal.
#[derive(Debug, Clone)]
pub struct ProposalResponse {
    pub peer: String,
    pub status: u16,
    pub payload: Vec<u8>,
    /// Digest of the simulated read/write footprint. Endorsers must agree
    /// on it for the transaction to be orderable.
    pub read_write_set: Vec<u8>,
}

impl ProposalResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Endorsed transaction handed to the ordering service.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub proposal: ProposalRequest,
    pub responses: Vec<ProposalResponse>,
}

/// Acknowledgment from the ordering service. A transport failure is an
/// `Err(LedgerError)` instead: the envelope may still have been ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingAck {
    Success,
    Rejected(String),
}

/// Terminal commit notification for one transaction on one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    Valid,
    Invalid(String),
}

/// One commit event channel. Callers bound the wait with their own timer;
/// the stream itself only fails on channel-level errors.
#[async_trait]
pub trait CommitStream: Send + Sync {
    async fn wait_commit(&self, tx_id: &str) -> Result<CommitStatus, LedgerError>;
}

/// A live connection to the ledger, scoped to one round: endorsing peers,
/// an ordering endpoint and the commit event channels it was built with.
#[async_trait]
pub trait LedgerConnection: Send + Sync {
    fn new_transaction_id(&self) -> TxId;

    async fn send_proposal(
        &self,
        request: &ProposalRequest,
        timeout: Duration,
    ) -> Result<Vec<ProposalResponse>, LedgerError>;

    async fn broadcast(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<OrderingAck, LedgerError>;

    /// One stream per commit event channel of this connection.
    fn commit_streams(&self) -> Vec<Arc<dyn CommitStream>>;
}

/// The ledger as a whole: one-time setup plus per-round connections.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Channel bootstrap (create/join). Runs once before any round.
    async fn init(&self) -> Result<()>;

    /// Contract deployment (install/instantiate). Runs once after `init`.
    async fn install_contract(&self) -> Result<()>;

    /// Builds a fresh connection for the named round.
    async fn connect(&self, round_name: &str) -> Result<Arc<dyn LedgerConnection>>;
}

/// A child load-generating node. The signal is one-way; children push their
/// block observations back through the orchestrator's block endpoint on
/// their own.
#[async_trait]
pub trait ChildNode: Send + Sync {
    fn name(&self) -> String;

    async fn signal_start(&self) -> Result<()>;
}
