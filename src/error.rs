//! Error types for binquant

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Structural misuse: unset or empty weight, empty input batch.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// Bias/weight or input/weight shapes disagree. A precondition violation.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Unsupported bit width / method combination, rejected at construction.
    #[error("Configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for the hard-failure class raised by structural misuse of a layer.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Error::PreconditionViolation(_) | Error::ShapeMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
