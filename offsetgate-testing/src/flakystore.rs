//! In-memory progress store with error and latency injection, for exercising commit retries,
//! commit timeouts and pruning failures.
//!
//! # Example
//! ```ignore
//! let store = FlakyStore::new();
//! store.error_injector().fail_writes(2);
//! store.error_injector().set_write_latency(500);
//! let tracker = ProgressTracker::open("uid", Arc::new(store.clone()), &partitions, options).await?;
//! ```

mod error_injector;
mod store;

pub use error_injector::StoreErrorInjector;
pub use store::FlakyStore;
