//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 container error.
    #[error("container error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] tesdaq_core::Error),

    /// Inconsistent container contents.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
