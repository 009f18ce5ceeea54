use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Controls the failures a [SimulatedSource](super::SimulatedSource) produces.
#[derive(Debug, Default)]
pub struct SourceErrorInjector {
    /// Fail the next N latest-position queries.
    fail_next_fetches: AtomicUsize,
    /// Fail the next N partition-count queries.
    fail_next_counts: AtomicUsize,
    /// Fail every call until cleared.
    unreachable: AtomicBool,
    /// Artificial latency of every call in milliseconds.
    latency_ms: AtomicU64,
}

impl SourceErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fetches(&self, count: usize) {
        self.fail_next_fetches.store(count, Ordering::Relaxed);
    }

    pub fn fail_counts(&self, count: usize) {
        self.fail_next_counts.store(count, Ordering::Relaxed);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_fetch(&self) -> bool {
        self.is_unreachable() || decrement_counter(&self.fail_next_fetches)
    }

    pub(crate) fn should_fail_count(&self) -> bool {
        self.is_unreachable() || decrement_counter(&self.fail_next_counts)
    }

    fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst)
    }

    pub(crate) async fn apply_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Decrements `counter` and returns true if it was > 0.
pub(crate) fn decrement_counter(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
        .is_ok()
}
