// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod config;
pub mod invoker;
pub mod ledger;
pub mod loopback;
pub mod monitor;
pub mod orchestrator;
pub mod round;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_utils;

// These are the top level things you should need to run a benchmark.
pub use config::{BenchmarkConfig, RoundConfig};
pub use orchestrator::{Orchestrator, RunStatus};

// We export these if you want finer grained control.
pub use invoker::{
    InvocationResult, TransactionInvoker, TxError, TxErrorKind, TxErrors, TxStatus,
};
pub use ledger::{
    ChildNode, CommitStatus, CommitStream, Envelope, Ledger, LedgerConnection, LedgerError,
    OrderingAck, ProposalRequest, ProposalResponse, TxId,
};
pub use loopback::{LoopbackLedger, LoopbackOptions};
pub use monitor::{MonitorProvider, NullMonitor, NullMonitorProvider, ResourceMonitor};
pub use round::{AddOutcome, ArgTuple, LoadQueue, Round, RoundReport};
pub use stats::{TxStats, TxStatsSummary};
