//! Error types for handle construction and stepping.

use thiserror::Error;

/// Errors raised by the evolution kernel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvolutionError {
    /// State/rule arity mismatch, detected at construction.
    #[error("Dimension error: {what}")]
    Dimension { what: String },

    /// Missing or invalid integration configuration.
    #[error("Config error: {what}")]
    Config { what: String },

    #[error("Unknown parameter: {key}")]
    UnknownParameter { key: String },

    /// The rule produced a non-finite state. Terminal for the handle.
    #[error("System diverged at t = {time}: non-finite state")]
    Diverged { time: f64 },

    /// The backend could not keep the requested tolerance above `dtmin`.
    #[error("Integration failure at t = {time}: step size {dt:e} fell below the minimum")]
    IntegrationFailure { time: f64, dt: f64 },
}

pub type EvolutionResult<T> = Result<T, EvolutionError>;

impl EvolutionError {
    pub(crate) fn dimension(what: impl Into<String>) -> Self {
        EvolutionError::Dimension { what: what.into() }
    }

    pub(crate) fn config(what: impl Into<String>) -> Self {
        EvolutionError::Config { what: what.into() }
    }

    pub(crate) fn unknown_parameter(key: impl Into<String>) -> Self {
        EvolutionError::UnknownParameter { key: key.into() }
    }
}
