// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

fn default_contract_id() -> String {
    "simple-addition".to_string()
}

fn default_contract_version() -> String {
    "v0".to_string()
}

fn default_invoke_timeout_secs() -> u64 {
    120
}

/// Static configuration of one benchmark round.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundConfig {
    pub name: String,
    /// Intake and send target for the round.
    #[serde(alias = "amountOfTransactions")]
    pub transactions_to_send: u64,
    /// Send rate in transactions per second.
    pub rate: f64,
    /// Contract function this round submits; candidate tuples are matched
    /// against it by their first element.
    pub function: String,
    #[serde(default = "default_contract_id")]
    pub contract_id: String,
    #[serde(default = "default_contract_version")]
    pub contract_version: String,
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
}

/// The benchmark as a whole: an ordered list of rounds, executed strictly
/// in sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    pub rounds: Vec<RoundConfig>,
}

impl BenchmarkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read benchmark configuration {:?}", path))?;
        let config: BenchmarkConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse benchmark configuration {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rounds.is_empty() {
            bail!("benchmark configuration contains no rounds");
        }
        for round in &self.rounds {
            if round.name.is_empty() {
                bail!("a round is missing its name");
            }
            if round.transactions_to_send == 0 {
                bail!("round {} has a zero transaction target", round.name);
            }
            if !round.rate.is_finite() || round.rate <= 0.0 {
                bail!("round {} has a non-positive rate", round.name);
            }
            if round.function.is_empty() {
                bail!("round {} names no contract function", round.name);
            }
            if round.invoke_timeout_secs == 0 {
                bail!("round {} has a zero invocation timeout", round.name);
            }
        }
        Ok(())
    }
}
