//! Computes how far every partition may advance in the next batch.
//!
//! Committed positions are the next sequence number to read, latest positions the newest
//! available one, and targets the last sequence number the next batch may read (inclusive). A
//! target of `committed - 1` is an empty allotment.
//!
//! Static mode caps each partition at `max_rate_per_partition` messages. Dynamic mode takes an
//! externally estimated total rate and splits it across partitions in proportion to their lag,
//! the number of available messages not read yet.
//! Shares are rounded with [f64::round] (half away from zero, which is half-up for the
//! non-negative shares here) independently per partition; the rounding remainder is not
//! redistributed, so the aggregate may drift from the signal by up to one message per partition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::PartitionId;

/// Bit pattern stored while no estimate is published.
const NO_SIGNAL: u64 = u64::MAX;

/// Handle through which a backpressure estimator publishes the currently allowed total rate.
/// Cloning shares the underlying value.
#[derive(Debug, Clone)]
pub struct RateSignal {
    bits: Arc<AtomicU64>,
}

impl Default for RateSignal {
    fn default() -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(NO_SIGNAL)),
        }
    }
}

impl RateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, allowed_total_rate: f64) {
        self.bits.store(allowed_total_rate.to_bits(), Ordering::Release);
    }

    pub fn clear(&self) {
        self.bits.store(NO_SIGNAL, Ordering::Release);
    }

    /// The published rate, if any. Non-finite or non-positive values count as absent.
    pub fn current(&self) -> Option<f64> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits == NO_SIGNAL {
            return None;
        }
        Some(f64::from_bits(bits)).filter(|rate| rate.is_finite() && *rate > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    max_rate_per_partition: i64,
}

impl RateLimiter {
    pub fn new(max_rate_per_partition: i64) -> Result<Self> {
        if max_rate_per_partition <= 0 {
            return Err(Error::Config(format!(
                "maxRatePerPartition must be positive, got {max_rate_per_partition}"
            )));
        }
        Ok(Self {
            max_rate_per_partition,
        })
    }

    pub fn max_rate_per_partition(&self) -> i64 {
        self.max_rate_per_partition
    }

    /// Target sequence number per partition of `committed`.
    ///
    /// Every target satisfies `committed - 1 <= target <= latest` whenever
    /// `committed <= latest + 1`, and never falls below `committed - 1`. Partitions without a
    /// `latest` entry do not advance. A `signal` that is absent or not positive selects static
    /// mode.
    pub fn compute_targets(
        &self,
        committed: &BTreeMap<PartitionId, i64>,
        latest: &BTreeMap<PartitionId, i64>,
        signal: Option<f64>,
    ) -> BTreeMap<PartitionId, i64> {
        match signal {
            Some(rate) if rate > 0.0 => self.dynamic_targets(committed, latest, rate),
            _ => self.static_targets(committed, latest),
        }
    }

    fn static_targets(
        &self,
        committed: &BTreeMap<PartitionId, i64>,
        latest: &BTreeMap<PartitionId, i64>,
    ) -> BTreeMap<PartitionId, i64> {
        committed
            .iter()
            .map(|(partition, from)| {
                let target = match latest.get(partition) {
                    Some(latest) => (*latest).min(last_of(*from, self.max_rate_per_partition)),
                    None => nothing_read(*from),
                };
                (partition.clone(), target.max(nothing_read(*from)))
            })
            .collect()
    }

    fn dynamic_targets(
        &self,
        committed: &BTreeMap<PartitionId, i64>,
        latest: &BTreeMap<PartitionId, i64>,
        allowed_total_rate: f64,
    ) -> BTreeMap<PartitionId, i64> {
        let lags: BTreeMap<&PartitionId, i64> = committed
            .iter()
            .map(|(partition, from)| {
                let lag = latest
                    .get(partition)
                    .map(|latest| latest.saturating_sub(*from).saturating_add(1).max(0))
                    .unwrap_or(0);
                (partition, lag)
            })
            .collect();
        let total_lag: i64 = lags.values().fold(0i64, |acc, lag| acc.saturating_add(*lag));

        committed
            .iter()
            .map(|(partition, from)| {
                let lag = lags.get(partition).copied().unwrap_or(0);
                if total_lag == 0 || lag == 0 {
                    return (partition.clone(), nothing_read(*from));
                }

                let share = share_of(lag, total_lag, allowed_total_rate);
                let advance = share.min(self.max_rate_per_partition);
                let target = match latest.get(partition) {
                    Some(latest) => last_of(*from, advance).min(*latest),
                    None => nothing_read(*from),
                };
                (partition.clone(), target.max(nothing_read(*from)))
            })
            .collect()
    }
}

/// Last sequence number of an allotment of `messages` starting at `from`.
fn last_of(from: i64, messages: i64) -> i64 {
    from.saturating_add(messages).saturating_sub(1)
}

/// Target that reads nothing from `from`.
fn nothing_read(from: i64) -> i64 {
    from.saturating_sub(1)
}

/// `round(lag / total_lag * rate)`, saturating into `i64`.
fn share_of(lag: i64, total_lag: i64, rate: f64) -> i64 {
    let share = (lag as f64 / total_lag as f64 * rate).round();
    // `as` saturates, NaN maps to 0
    share as i64
}
