// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Transaction outcome protocol: submits one logical transaction through the
//! endorse/order/commit write path and classifies the result. Every failure
//! mode is folded into the returned record; `invoke` itself never fails.

use crate::ledger::{
    CommitStatus, Envelope, LedgerConnection, OrderingAck, ProposalRequest, ProposalResponse, TxId,
};
use futures::future::join_all;
use log::{debug, warn};
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Floor applied to the ordering/commit deadline once the endorsement phase
/// has eaten into the caller's budget.
pub const MIN_ORDERING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Created,
    Submitted,
    Success,
    Failed,
}

/// Where in the transaction life-cycle an error was observed. The `Bad*`
/// kinds are explicit rejections; the others are transport-level and leave
/// the true outcome unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    ProposalResponse,
    BadProposalResponse,
    OrdererResponse,
    BadOrdererResponse,
    EventNotification,
    BadEventNotification,
}

impl TxErrorKind {
    pub const ALL: [TxErrorKind; 6] = [
        TxErrorKind::ProposalResponse,
        TxErrorKind::BadProposalResponse,
        TxErrorKind::OrdererResponse,
        TxErrorKind::BadOrdererResponse,
        TxErrorKind::EventNotification,
        TxErrorKind::BadEventNotification,
    ];

    /// OR-combinable bit for histogram and membership views.
    pub fn flag(self) -> u8 {
        match self {
            TxErrorKind::ProposalResponse => 1,
            TxErrorKind::BadProposalResponse => 2,
            TxErrorKind::OrdererResponse => 4,
            TxErrorKind::BadOrdererResponse => 8,
            TxErrorKind::EventNotification => 16,
            TxErrorKind::BadEventNotification => 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxError {
    pub kind: TxErrorKind,
    pub message: String,
}

/// Errors observed during one invocation, at most one entry per kind.
#[derive(Debug, Clone, Default)]
pub struct TxErrors {
    entries: Vec<TxError>,
}

impl TxErrors {
    /// Records `kind`, keeping only the latest message for it.
    pub fn record(&mut self, kind: TxErrorKind, message: impl Into<String>) {
        let message = message.into();
        match self.entries.iter_mut().find(|e| e.kind == kind) {
            Some(existing) => existing.message = message,
            None => self.entries.push(TxError { kind, message }),
        }
    }

    pub fn contains(&self, kind: TxErrorKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn flags(&self) -> u8 {
        self.entries.iter().fold(0, |acc, e| acc | e.kind.flag())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxError> {
        self.entries.iter()
    }
}

/// Outcome record of one invocation. Mutated only while the invocation runs,
/// immutable once returned. Timestamps are milliseconds since epoch; a zero
/// means the phase was never reached.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub id: TxId,
    pub status: TxStatus,
    pub time_create: u64,
    pub time_endorse: u64,
    pub time_order: u64,
    pub time_final: u64,
    pub result: Option<Vec<u8>>,
    /// Whether the final status was independently confirmed (an explicit
    /// rejection or an explicit commit event) rather than assumed.
    pub verified: bool,
    pub errors: TxErrors,
}

impl InvocationResult {
    fn new(id: TxId) -> Self {
        Self {
            id,
            status: TxStatus::Created,
            time_create: unix_millis(),
            time_endorse: 0,
            time_order: 0,
            time_final: 0,
            result: None,
            verified: false,
            errors: TxErrors::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    /// Creation-to-confirmation latency. Meaningful for successes only.
    pub fn latency_ms(&self) -> u64 {
        self.time_final.saturating_sub(self.time_create)
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(5)]
}

/// How one commit event channel settled.
enum ChannelVerdict {
    Valid,
    Invalid(String),
    Inconclusive(String),
}

pub struct TransactionInvoker {
    connection: Arc<dyn LedgerConnection>,
}

impl TransactionInvoker {
    pub fn new(connection: Arc<dyn LedgerConnection>) -> Self {
        Self { connection }
    }

    /// Runs the full outcome protocol for one transaction. The first element
    /// of `args` names the contract function, mirroring the candidate-tuple
    /// layout blocks are observed in.
    pub async fn invoke(
        &self,
        contract_id: &str,
        contract_version: &str,
        mut args: Vec<String>,
        timeout: Duration,
    ) -> InvocationResult {
        let started = Instant::now();
        let tx_id = self.connection.new_transaction_id();
        let mut outcome = InvocationResult::new(tx_id.clone());

        if args.is_empty() {
            outcome.time_endorse = unix_millis();
            outcome
                .errors
                .record(TxErrorKind::ProposalResponse, "empty argument tuple");
            outcome.verified = true;
            return self.fail(outcome);
        }
        let function = args.remove(0);
        let request = ProposalRequest {
            contract_id: contract_id.to_string(),
            contract_version: contract_version.to_string(),
            function,
            args,
            tx_id: tx_id.clone(),
        };

        // Phase 1: propose to the endorsing peers.
        let responses = match self.connection.send_proposal(&request, timeout).await {
            Ok(responses) => {
                outcome.time_endorse = unix_millis();
                responses
            }
            Err(err) => {
                outcome.time_endorse = unix_millis();
                outcome
                    .errors
                    .record(TxErrorKind::ProposalResponse, err.to_string());
                // Nothing was endorsed, so the transaction cannot proceed.
                outcome.verified = true;
                return self.fail(outcome);
            }
        };

        // Phase 2: every endorsement must succeed and agree.
        if let Err(message) = validate_endorsements(&responses) {
            outcome
                .errors
                .record(TxErrorKind::BadProposalResponse, message);
            outcome.verified = true;
            return self.fail(outcome);
        }
        outcome.result = responses.first().map(|r| r.payload.clone());

        let mut remaining = timeout.saturating_sub(started.elapsed());
        if remaining < MIN_ORDERING_TIMEOUT {
            warn!(
                "Remaining deadline for [{}] is below {:?}, using the floor instead",
                short_id(&tx_id),
                MIN_ORDERING_TIMEOUT
            );
            remaining = MIN_ORDERING_TIMEOUT;
        }

        // Phase 4 listeners go up before the broadcast so a commit event
        // racing the ordering ack is not lost. Each listener runs its own
        // timer; none cancels a sibling.
        let watchers: Vec<_> = self
            .connection
            .commit_streams()
            .into_iter()
            .map(|stream| {
                let tx_id = tx_id.clone();
                async move {
                    match tokio::time::timeout(remaining, stream.wait_commit(&tx_id)).await {
                        Ok(Ok(CommitStatus::Valid)) => ChannelVerdict::Valid,
                        Ok(Ok(CommitStatus::Invalid(code))) => ChannelVerdict::Invalid(code),
                        Ok(Err(err)) => ChannelVerdict::Inconclusive(err.to_string()),
                        Err(_) => ChannelVerdict::Inconclusive(format!(
                            "no commit event within {:?}",
                            remaining
                        )),
                    }
                }
            })
            .collect();
        let watchers = tokio::spawn(join_all(watchers));

        // Phase 3: hand the endorsed envelope to the ordering service.
        let envelope = Envelope {
            proposal: request,
            responses,
        };
        match self.connection.broadcast(envelope, remaining).await {
            Ok(OrderingAck::Success) => {
                outcome.time_order = unix_millis();
                outcome.status = TxStatus::Submitted;
            }
            Ok(OrderingAck::Rejected(code)) => {
                outcome.time_order = unix_millis();
                outcome.errors.record(
                    TxErrorKind::BadOrdererResponse,
                    format!("ordering service rejected the envelope: {}", code),
                );
                // Explicit rejection, the transaction will never be ordered.
                outcome.verified = true;
                watchers.abort();
                return self.fail(outcome);
            }
            Err(err) => {
                outcome.time_order = unix_millis();
                // Missing the ack proves nothing, the envelope may already be
                // under ordering. Let the commit events decide.
                outcome
                    .errors
                    .record(TxErrorKind::OrdererResponse, err.to_string());
            }
        }

        // Phase 4: join all listeners. First-settle must not short-circuit,
        // one channel's ambiguity could hide another's conclusive answer.
        let verdicts = watchers.await.unwrap_or_default();
        let mut any_valid = false;
        let mut any_invalid = false;
        for verdict in verdicts {
            match verdict {
                ChannelVerdict::Valid => any_valid = true,
                ChannelVerdict::Invalid(code) => {
                    any_invalid = true;
                    outcome.errors.record(
                        TxErrorKind::BadEventNotification,
                        format!("invalid transaction: {}", code),
                    );
                }
                ChannelVerdict::Inconclusive(message) => {
                    outcome.errors.record(TxErrorKind::EventNotification, message);
                }
            }
        }

        if any_invalid {
            outcome.verified = true;
            return self.fail(outcome);
        }
        if any_valid {
            outcome.verified = true;
            outcome.status = TxStatus::Success;
            outcome.time_final = unix_millis();
            return outcome;
        }
        // Every channel was inconclusive: report failure without claiming
        // certainty. This is the explicit "cannot be sure" outcome.
        debug!(
            "Failed to complete transaction [{}]: every event channel was inconclusive",
            short_id(&outcome.id)
        );
        outcome.status = TxStatus::Failed;
        outcome.time_final = unix_millis();
        outcome
    }

    /// Read-only query against the endorsing peers. Never reaches ordering
    /// or commit events; agreement across responses stands in for them.
    pub async fn query(
        &self,
        contract_id: &str,
        contract_version: &str,
        key: &str,
        timeout: Duration,
    ) -> InvocationResult {
        let tx_id = self.connection.new_transaction_id();
        let mut outcome = InvocationResult::new(tx_id.clone());
        let request = ProposalRequest {
            contract_id: contract_id.to_string(),
            contract_version: contract_version.to_string(),
            function: "query".to_string(),
            args: vec![key.to_string()],
            tx_id,
        };

        let responses = match self.connection.send_proposal(&request, timeout).await {
            Ok(responses) => responses,
            Err(err) => {
                outcome
                    .errors
                    .record(TxErrorKind::ProposalResponse, err.to_string());
                outcome.verified = true;
                return self.fail(outcome);
            }
        };

        let first = match responses.first() {
            Some(first) if first.is_ok() => first,
            _ => {
                outcome
                    .errors
                    .record(TxErrorKind::BadProposalResponse, "no query responses");
                outcome.verified = true;
                return self.fail(outcome);
            }
        };
        if responses[1..]
            .iter()
            .any(|r| !r.is_ok() || r.payload != first.payload)
        {
            outcome.errors.record(
                TxErrorKind::BadProposalResponse,
                "conflicting query responses",
            );
            outcome.verified = true;
            return self.fail(outcome);
        }

        outcome.result = Some(first.payload.clone());
        outcome.status = TxStatus::Success;
        outcome.verified = true;
        outcome.time_final = unix_millis();
        outcome
    }

    fn fail(&self, mut outcome: InvocationResult) -> InvocationResult {
        outcome.status = TxStatus::Failed;
        outcome.time_final = unix_millis();
        debug!(
            "Failed to complete transaction [{}]: flags {:#04x}",
            short_id(&outcome.id),
            outcome.errors.flags()
        );
        outcome
    }
}

fn validate_endorsements(responses: &[ProposalResponse]) -> Result<(), String> {
    if responses.is_empty() {
        return Err("no endorsement responses received".to_string());
    }
    for response in responses {
        if !response.is_ok() {
            return Err(format!(
                "endorsement denied by {} with status code {}",
                response.peer, response.status
            ));
        }
    }
    let footprint = &responses[0].read_write_set;
    if responses[1..].iter().any(|r| &r.read_write_set != footprint) {
        return Err("read/write set mismatch between endorsements".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{BroadcastPlan, ChannelPlan, ProposalPlan, ScriptedConnection};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(120);

    fn invoker(connection: ScriptedConnection) -> TransactionInvoker {
        TransactionInvoker::new(Arc::new(connection))
    }

    fn args() -> Vec<String> {
        vec!["move".to_string(), "a".to_string(), "b".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn commit_on_every_channel_is_a_verified_success() {
        let invoker = invoker(ScriptedConnection::healthy(2));
        let result = invoker.invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Success);
        assert!(result.verified);
        assert!(result.errors.is_empty());
        assert!(result.time_endorse >= result.time_create);
        assert!(result.time_final >= result.time_order);
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_transport_failure_is_conclusive() {
        let connection = ScriptedConnection {
            proposal: ProposalPlan::TransportError,
            ..ScriptedConnection::healthy(2)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert_eq!(result.errors.flags(), TxErrorKind::ProposalResponse.flag());
        // The remaining phases never ran.
        assert_eq!(result.time_order, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_endorsement_is_a_verified_failure() {
        let connection = ScriptedConnection {
            proposal: ProposalPlan::Denied { status: 500 },
            ..ScriptedConnection::healthy(2)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert_eq!(
            result.errors.flags(),
            TxErrorKind::BadProposalResponse.flag()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_write_set_mismatch_is_a_verified_failure() {
        let connection = ScriptedConnection {
            proposal: ProposalPlan::Diverging,
            ..ScriptedConnection::healthy(2)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert!(result.errors.contains(TxErrorKind::BadProposalResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn orderer_rejection_aborts_before_events() {
        let connection = ScriptedConnection {
            broadcast: BroadcastPlan::Rejected("SERVICE_UNAVAILABLE".to_string()),
            ..ScriptedConnection::healthy(2)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert_eq!(result.errors.flags(), TxErrorKind::BadOrdererResponse.flag());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_ack_with_silent_channels_stays_unverified() {
        let connection = ScriptedConnection {
            broadcast: BroadcastPlan::TransportError,
            channels: vec![ChannelPlan::Never, ChannelPlan::Never],
            ..ScriptedConnection::healthy(0)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(!result.verified);
        assert_eq!(
            result.errors.flags(),
            TxErrorKind::OrdererResponse.flag() | TxErrorKind::EventNotification.flag()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_commit_outweighs_a_timed_out_sibling() {
        let connection = ScriptedConnection {
            channels: vec![
                ChannelPlan::Valid {
                    delay: Duration::from_millis(50),
                },
                ChannelPlan::Never,
            ],
            ..ScriptedConnection::healthy(0)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Success);
        assert!(result.verified);
        assert_eq!(result.errors.flags(), TxErrorKind::EventNotification.flag());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commit_outweighs_a_valid_sibling() {
        let connection = ScriptedConnection {
            channels: vec![
                ChannelPlan::Valid {
                    delay: Duration::from_millis(10),
                },
                ChannelPlan::Invalid {
                    code: "MVCC_READ_CONFLICT".to_string(),
                    delay: Duration::from_millis(20),
                },
            ],
            ..ScriptedConnection::healthy(0)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert!(result.errors.contains(TxErrorKind::BadEventNotification));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_leaves_the_other_channel_decisive() {
        let connection = ScriptedConnection {
            channels: vec![
                ChannelPlan::Error,
                ChannelPlan::Valid {
                    delay: Duration::from_millis(30),
                },
            ],
            ..ScriptedConnection::healthy(0)
        };
        let result = invoker(connection).invoke("contract", "v0", args(), TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Success);
        assert!(result.verified);
        assert_eq!(result.errors.flags(), TxErrorKind::EventNotification.flag());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_argument_tuple_fails_at_propose() {
        let invoker = invoker(ScriptedConnection::healthy(2));
        let result = invoker.invoke("contract", "v0", vec![], TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Failed);
        assert!(result.verified);
        assert!(result.errors.contains(TxErrorKind::ProposalResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn query_agreement_succeeds() {
        let invoker = invoker(ScriptedConnection::healthy(2));
        let result = invoker.query("contract", "v0", "answer", TIMEOUT).await;
        assert_eq!(result.status, TxStatus::Success);
        assert!(result.verified);
        assert!(result.result.is_some());
    }

    #[test]
    fn errors_keep_one_entry_per_kind() {
        let mut errors = TxErrors::default();
        errors.record(TxErrorKind::EventNotification, "first");
        errors.record(TxErrorKind::EventNotification, "second");
        errors.record(TxErrorKind::OrdererResponse, "ack lost");
        assert_eq!(errors.iter().count(), 2);
        assert_eq!(
            errors.flags(),
            TxErrorKind::EventNotification.flag() | TxErrorKind::OrdererResponse.flag()
        );
        let message = errors
            .iter()
            .find(|e| e.kind == TxErrorKind::EventNotification)
            .map(|e| e.message.clone());
        assert_eq!(message.as_deref(), Some("second"));
    }
}
