// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-round and cross-node transaction statistics. All internal math is in
//! milliseconds; seconds only appear in the rendered summary.

use crate::invoker::{InvocationResult, TxErrorKind, TxStatus};
use itertools::Itertools;
use std::fmt;

/// Closed `[min, max]` span of millisecond timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub min: u64,
    pub max: u64,
}

impl Default for TimeSpan {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
        }
    }
}

impl TimeSpan {
    fn observe(&mut self, value: u64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn widen(&mut self, other: &TimeSpan) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn width_ms(&self) -> u64 {
        self.max.saturating_sub(self.min)
    }
}

/// Latency aggregate over the successful invocations. `detail` holds one
/// sample per success when detail capture is on, for percentile computation
/// at the very top of the merge tree.
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub detail: Vec<u64>,
}

impl Default for LatencySummary {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            detail: Vec::new(),
        }
    }
}

/// Error-kind histogram. `unverified` counts ambiguous failures (failed
/// without independent confirmation) so they stay distinguishable from
/// confirmed rejections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorHistogram {
    counts: [u64; TxErrorKind::ALL.len()],
    pub unverified: u64,
}

impl ErrorHistogram {
    fn observe(&mut self, result: &InvocationResult) {
        for (slot, kind) in self.counts.iter_mut().zip(TxErrorKind::ALL) {
            if result.errors.contains(kind) {
                *slot += 1;
            }
        }
        if result.status == TxStatus::Failed && !result.verified {
            self.unverified += 1;
        }
    }

    fn absorb(&mut self, other: &ErrorHistogram) {
        for (slot, count) in self.counts.iter_mut().zip(other.counts) {
            *slot += count;
        }
        self.unverified += other.unverified;
    }

    pub fn count(&self, kind: TxErrorKind) -> u64 {
        self.counts[TxErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(0)]
    }

    pub fn is_empty(&self) -> bool {
        self.unverified == 0 && self.counts.iter().all(|c| *c == 0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxStats {
    pub succ: u64,
    pub fail: u64,
    /// Span of creation timestamps over all invocations.
    pub create: TimeSpan,
    /// Span of confirmation timestamps over successful invocations.
    pub confirm: TimeSpan,
    pub delay: LatencySummary,
    pub errors: ErrorHistogram,
}

impl TxStats {
    /// Folds a batch of invocation results. `detail` keeps one latency
    /// sample per success for percentile computation.
    pub fn from_results(results: &[InvocationResult], detail: bool) -> TxStats {
        let mut stats = TxStats::default();
        for result in results {
            stats.create.observe(result.time_create);
            stats.errors.observe(result);
            if result.is_success() {
                stats.succ += 1;
                stats.confirm.observe(result.time_final);
                let latency = result.latency_ms();
                stats.delay.min = stats.delay.min.min(latency);
                stats.delay.max = stats.delay.max.max(latency);
                stats.delay.sum += latency;
                if detail {
                    stats.delay.detail.push(latency);
                }
            } else {
                stats.fail += 1;
            }
        }
        stats
    }

    /// An entry that carries no outcomes at all. Skipped by `merge`.
    pub fn is_degenerate(&self) -> bool {
        self.succ + self.fail == 0
    }

    /// Left-folds a list of statistics. Degenerate entries are dropped;
    /// `None` means nothing usable was left, which callers must surface
    /// instead of fabricating zeros.
    pub fn merge(stats: impl IntoIterator<Item = TxStats>) -> Option<TxStats> {
        let mut iter = stats.into_iter().skip_while(TxStats::is_degenerate);
        let mut merged = iter.next()?;
        for entry in iter {
            if entry.is_degenerate() {
                continue;
            }
            merged.absorb(entry);
        }
        Some(merged)
    }

    fn absorb(&mut self, other: TxStats) {
        self.succ += other.succ;
        self.fail += other.fail;
        self.create.widen(&other.create);
        self.confirm.widen(&other.confirm);
        self.delay.min = self.delay.min.min(other.delay.min);
        self.delay.max = self.delay.max.max(other.delay.max);
        self.delay.sum += other.delay.sum;
        self.delay.detail.extend(other.delay.detail);
        self.errors.absorb(&other.errors);
    }

    /// Latency at quantile `q` (0..=1) over the captured detail samples.
    pub fn percentile_ms(&self, q: f64) -> Option<u64> {
        if self.delay.detail.is_empty() {
            return None;
        }
        let sorted: Vec<u64> = self.delay.detail.iter().copied().sorted().collect();
        let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    /// Completed transactions per second over the creation span.
    pub fn send_rate_tps(&self) -> f64 {
        let total = self.succ + self.fail;
        if self.create.is_empty() || self.create.width_ms() == 0 {
            return total as f64;
        }
        total as f64 * 1000.0 / self.create.width_ms() as f64
    }

    /// Confirmed transactions per second, first creation to last commit.
    pub fn throughput_tps(&self) -> f64 {
        if self.confirm.is_empty() {
            return 0.0;
        }
        let window = self.confirm.max.saturating_sub(self.create.min);
        if window == 0 {
            return self.succ as f64;
        }
        self.succ as f64 * 1000.0 / window as f64
    }

    pub fn summary<'a>(&'a self, label: &'a str) -> TxStatsSummary<'a> {
        TxStatsSummary { stats: self, label }
    }
}

/// Human-readable rendering of one statistics record. This is the only
/// place latencies leave milliseconds.
pub struct TxStatsSummary<'a> {
    stats: &'a TxStats,
    label: &'a str,
}

fn secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

impl fmt::Display for TxStatsSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats;
        write!(
            f,
            "{}: succ {}, fail {}, send rate {:.0} tps, throughput {:.0} tps",
            self.label,
            stats.succ,
            stats.fail,
            stats.send_rate_tps(),
            stats.throughput_tps(),
        )?;
        if stats.succ > 0 {
            write!(
                f,
                ", latency min/avg/max {:.2}/{:.2}/{:.2} s",
                secs(stats.delay.min),
                secs(stats.delay.sum / stats.succ),
                secs(stats.delay.max),
            )?;
        }
        match stats.percentile_ms(0.75) {
            Some(p75) => write!(f, ", p75 {:.2} s", secs(p75))?,
            None => write!(f, ", p75 N/A")?,
        }
        if stats.errors.unverified > 0 {
            write!(f, ", unverified {}", stats.errors.unverified)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{InvocationResult, TxErrors, TxStatus};

    fn result(created: u64, finished: u64, status: TxStatus, verified: bool) -> InvocationResult {
        InvocationResult {
            id: format!("tx-{}", created),
            status,
            time_create: created,
            time_endorse: created + 1,
            time_order: created + 2,
            time_final: finished,
            result: None,
            verified,
            errors: TxErrors::default(),
        }
    }

    fn stats(succ: u64, fail: u64) -> TxStats {
        let mut results = Vec::new();
        for i in 0..succ {
            results.push(result(1_000 + i, 2_000 + i, TxStatus::Success, true));
        }
        for i in 0..fail {
            results.push(result(1_500 + i, 1_600 + i, TxStatus::Failed, true));
        }
        TxStats::from_results(&results, true)
    }

    #[test]
    fn fold_counts_and_spans() {
        let folded = stats(3, 2);
        assert_eq!(folded.succ, 3);
        assert_eq!(folded.fail, 2);
        assert_eq!(folded.create.min, 1_000);
        assert_eq!(folded.create.max, 1_501);
        assert_eq!(folded.confirm.max, 2_002);
        assert_eq!(folded.delay.detail.len(), 3);
        assert_eq!(folded.delay.sum, 3_000);
    }

    #[test]
    fn merge_skips_degenerate_leading_entry() {
        let real = stats(5, 1);
        let merged = TxStats::merge(vec![TxStats::default(), real.clone()])
            .expect("one usable entry");
        assert_eq!(merged.succ, real.succ);
        assert_eq!(merged.fail, real.fail);
        assert_eq!(merged.create, real.create);
        assert_eq!(merged.confirm, real.confirm);
        assert_eq!(merged.delay.sum, real.delay.sum);
        assert_eq!(merged.delay.detail, real.delay.detail);
    }

    #[test]
    fn merge_of_only_degenerates_reports_nothing() {
        assert!(TxStats::merge(vec![TxStats::default(), TxStats::default()]).is_none());
    }

    #[test]
    fn merge_is_order_independent_on_commutative_fields() {
        let a = stats(2, 1);
        let b = stats(4, 0);
        let ab = TxStats::merge(vec![a.clone(), b.clone()]).unwrap();
        let ba = TxStats::merge(vec![b, a]).unwrap();
        assert_eq!(ab.succ, ba.succ);
        assert_eq!(ab.fail, ba.fail);
        assert_eq!(ab.create, ba.create);
        assert_eq!(ab.confirm, ba.confirm);
        assert_eq!(ab.delay.min, ba.delay.min);
        assert_eq!(ab.delay.max, ba.delay.max);
        assert_eq!(ab.delay.sum, ba.delay.sum);
        let mut ab_detail = ab.delay.detail.clone();
        let mut ba_detail = ba.delay.detail.clone();
        ab_detail.sort_unstable();
        ba_detail.sort_unstable();
        assert_eq!(ab_detail, ba_detail);
    }

    #[test]
    fn ambiguous_failures_land_in_their_own_bucket() {
        let results = vec![
            result(1_000, 1_100, TxStatus::Success, true),
            result(1_010, 1_200, TxStatus::Failed, false),
            result(1_020, 1_300, TxStatus::Failed, true),
        ];
        let stats = TxStats::from_results(&results, false);
        assert_eq!(stats.fail, 2);
        assert_eq!(stats.errors.unverified, 1);
    }

    #[test]
    fn percentile_picks_the_upper_sample() {
        let mut stats = stats(4, 0);
        stats.delay.detail = vec![100, 200, 300, 400];
        assert_eq!(stats.percentile_ms(0.75), Some(400));
        assert_eq!(stats.percentile_ms(0.5), Some(300));
    }

    #[test]
    fn zero_width_send_rate_degrades_to_count() {
        let results = vec![
            result(1_000, 1_100, TxStatus::Success, true),
            result(1_000, 1_150, TxStatus::Success, true),
        ];
        let stats = TxStats::from_results(&results, false);
        assert_eq!(stats.send_rate_tps() as u64, 2);
    }
}
