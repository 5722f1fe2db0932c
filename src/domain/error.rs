use thiserror::Error;

/// Failure kinds of a control cycle.
///
/// Only `ConfigInvalid` is fatal, and only during startup. Everything else
/// is scoped to a single planning cycle or a single RTL tick.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("required data unavailable: {0}")]
    DataUnavailable(String),

    #[error("invalid horizon: {0}")]
    HorizonInvalid(String),

    #[error("thermal model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("thermal model learning failed: {0}")]
    ModelLearnFailed(String),

    #[error("planning problem is infeasible")]
    SolverInfeasible,

    #[error("solver failure: {0}")]
    SolverError(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("transient bus failure: {0}")]
    BusTransient(String),
}

impl ControlError {
    /// Stable machine-readable code, used in acks and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::ConfigInvalid(_) => "CONFIG_INVALID",
            ControlError::DataUnavailable(_) => "DATA_UNAVAILABLE",
            ControlError::HorizonInvalid(_) => "HORIZON_INVALID",
            ControlError::ModelLoadFailed(_) => "MODEL_LOAD_FAILED",
            ControlError::ModelLearnFailed(_) => "MODEL_LEARN_FAILED",
            ControlError::SolverInfeasible => "SOLVER_INFEASIBLE",
            ControlError::SolverError(_) => "SOLVER_ERROR",
            ControlError::WriteFailed(_) => "WRITE_FAILED",
            ControlError::BusTransient(_) => "BUS_TRANSIENT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ControlError::SolverInfeasible.code(), "SOLVER_INFEASIBLE");
        assert_eq!(
            ControlError::DataUnavailable("x".into()).code(),
            "DATA_UNAVAILABLE"
        );
    }
}
