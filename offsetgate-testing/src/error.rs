use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimulationError>;

/// Failures the simulations produce. They convert into the core error the way a real client's
/// failures would be reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Engine crashed: {0}")]
    Crashed(String),

    #[error("Injected store failure: {0}")]
    Store(String),
}

impl From<SimulationError> for offsetgate_core::Error {
    fn from(value: SimulationError) -> Self {
        match value {
            SimulationError::Unreachable(_) | SimulationError::UnknownPartition(_) => {
                offsetgate_core::Error::SourceUnavailable {
                    reason: value.to_string(),
                }
            }
            SimulationError::Crashed(_) => offsetgate_core::Error::Executor(value.to_string()),
            SimulationError::Store(_) => offsetgate_core::Error::Store(value.to_string()),
        }
    }
}
