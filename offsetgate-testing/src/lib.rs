//! Offsetgate Testing Utilities.

/// Error type shared by the simulations.
pub mod error;

/// Simulated upstream partitioned log.
pub mod simsource;

/// Simulated batch engine with its own start/end markers.
pub mod simengine;

/// In-memory progress store with error and latency injection.
pub mod flakystore;

pub use error::{Result, SimulationError};
