//! Simulated upstream log.
//!
//! Partitions hold nothing but a message count; message `n` of a partition has sequence number
//! `n` and byte offset `n * RECORD_SIZE`. Producers append, the core only ever asks for the end
//! position of a partition.
//!
//! # Example
//! ```ignore
//! let source = SimulatedSource::new("telemetry", 2);
//! source.append(0, 500);
//! source.error_injector().fail_fetches(3);
//! source.error_injector().set_unreachable(true);
//! ```

pub(crate) mod error_injector;
mod source;

pub use error_injector::SourceErrorInjector;
pub use source::{RECORD_SIZE, SimulatedSource, position_of};
