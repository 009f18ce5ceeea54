use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::simsource::error_injector::decrement_counter;

/// Controls how a [SimulatedEngine](super::SimulatedEngine) misbehaves.
#[derive(Debug)]
pub struct EngineErrorInjector {
    /// Crash the next N executions after the start marker, before consuming anything.
    crash_before_end: AtomicUsize,
    /// Crash the next N executions right after the end marker was recorded.
    crash_after_end: AtomicUsize,
    /// Share of every range actually consumed, in percent.
    consume_percent: AtomicU64,
    /// Added to every reported sequence number.
    over_report_by: AtomicI64,
    /// Artificial execution latency in milliseconds.
    latency_ms: AtomicU64,
}

impl Default for EngineErrorInjector {
    fn default() -> Self {
        Self {
            crash_before_end: AtomicUsize::new(0),
            crash_after_end: AtomicUsize::new(0),
            consume_percent: AtomicU64::new(100),
            over_report_by: AtomicI64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl EngineErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn crash_before_end_marker(&self, count: usize) {
        self.crash_before_end.store(count, Ordering::Relaxed);
    }

    pub fn crash_after_end_marker(&self, count: usize) {
        self.crash_after_end.store(count, Ordering::Relaxed);
    }

    /// Consume only `percent` of every planned range, clamped to `0..=100`.
    pub fn consume_percent(&self, percent: u64) {
        self.consume_percent
            .store(percent.min(100), Ordering::Relaxed);
    }

    pub fn over_report_by(&self, messages: i64) {
        self.over_report_by.store(messages, Ordering::Relaxed);
    }

    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn should_crash_before_end(&self) -> bool {
        decrement_counter(&self.crash_before_end)
    }

    pub(crate) fn should_crash_after_end(&self) -> bool {
        decrement_counter(&self.crash_after_end)
    }

    pub(crate) fn percent(&self) -> i64 {
        self.consume_percent.load(Ordering::Relaxed) as i64
    }

    pub(crate) fn extra(&self) -> i64 {
        self.over_report_by.load(Ordering::Relaxed)
    }

    pub(crate) async fn apply_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let injector = EngineErrorInjector::new();
        assert!(!injector.should_crash_before_end());
        assert!(!injector.should_crash_after_end());
        assert_eq!(injector.percent(), 100);
        assert_eq!(injector.extra(), 0);

        injector.consume_percent(250);
        assert_eq!(injector.percent(), 100);
    }
}
