use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::simsource::error_injector::decrement_counter;

/// Controller for injecting store failures.
#[derive(Debug, Default)]
pub struct StoreErrorInjector {
    /// Fail the next N reads.
    fail_next_reads: AtomicUsize,
    /// Fail the next N writes.
    fail_next_writes: AtomicUsize,
    /// Fail the next N listings.
    fail_next_lists: AtomicUsize,
    /// Fail the next N deletes.
    fail_next_deletes: AtomicUsize,
    /// Artificial write latency in milliseconds.
    write_latency_ms: AtomicU64,
    /// Writes that actually reached the inner store.
    writes: AtomicUsize,
}

impl StoreErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::Relaxed);
    }

    pub fn fail_lists(&self, count: usize) {
        self.fail_next_lists.store(count, Ordering::Relaxed);
    }

    pub fn fail_deletes(&self, count: usize) {
        self.fail_next_deletes.store(count, Ordering::Relaxed);
    }

    pub fn set_write_latency(&self, ms: u64) {
        self.write_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn should_fail_read(&self) -> bool {
        decrement_counter(&self.fail_next_reads)
    }

    pub(crate) fn should_fail_write(&self) -> bool {
        decrement_counter(&self.fail_next_writes)
    }

    pub(crate) fn should_fail_list(&self) -> bool {
        decrement_counter(&self.fail_next_lists)
    }

    pub(crate) fn should_fail_delete(&self) -> bool {
        decrement_counter(&self.fail_next_deletes)
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) async fn apply_write_latency(&self) {
        let ms = self.write_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
