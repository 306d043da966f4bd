// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Resource monitoring capability. The harness only starts/stops a monitor
//! around each round and reads its time series back for the round summary;
//! how the samples are gathered is the implementation's business.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Arc;

#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Keys of the observed peers, used to index the history getters.
    fn peers(&self) -> Vec<String>;

    /// Memory samples in MB for one peer, oldest first.
    fn mem_history(&self, peer: &str) -> Vec<f64>;

    /// CPU samples in percent for one peer, oldest first.
    fn cpu_history(&self, peer: &str) -> Vec<f64>;

    /// (received, transmitted) MB samples for one peer, oldest first.
    fn network_history(&self, peer: &str) -> Vec<(f64, f64)>;
}

/// Hands out the monitor for a round, correlated by round name.
pub trait MonitorProvider: Send + Sync {
    fn monitor_for(&self, round_name: &str) -> Arc<dyn ResourceMonitor>;
}

/// Monitor that observes nothing. Used when no sampling backend is wired
/// up, e.g. in loopback runs and tests.
pub struct NullMonitor;

#[async_trait]
impl ResourceMonitor for NullMonitor {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn peers(&self) -> Vec<String> {
        Vec::new()
    }

    fn mem_history(&self, _peer: &str) -> Vec<f64> {
        Vec::new()
    }

    fn cpu_history(&self, _peer: &str) -> Vec<f64> {
        Vec::new()
    }

    fn network_history(&self, _peer: &str) -> Vec<(f64, f64)> {
        Vec::new()
    }
}

static NULL_MONITOR: Lazy<Arc<NullMonitor>> = Lazy::new(|| Arc::new(NullMonitor));

/// Provider handing every round the shared no-op monitor.
pub struct NullMonitorProvider;

impl MonitorProvider for NullMonitorProvider {
    fn monitor_for(&self, _round_name: &str) -> Arc<dyn ResourceMonitor> {
        NULL_MONITOR.clone()
    }
}
