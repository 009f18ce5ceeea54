//! Simulated batch engine.
//!
//! Keeps its own start/end markers the way a checkpointing engine would: the start marker is
//! written before a batch is consumed, the end marker once consumption finished. Crashes can be
//! injected on either side of the end marker.

mod engine;
mod error_injector;

pub use engine::{ExecutedBatch, SimulatedEngine};
pub use error_injector::EngineErrorInjector;
