//! Trigger error types.

use thiserror::Error;

/// Result type for trigger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Trigger error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Io(#[from] tesdaq_io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] tesdaq_core::Error),

    /// Missing or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation called in the wrong engine state.
    #[error("state error: {0}")]
    State(String),

    /// Input data unusable for noise estimation.
    #[error("data quality error: {0}")]
    DataQuality(String),
}
