//! Error types for tesdaq-core.

use thiserror::Error;

/// Result type alias for tesdaq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for tesdaq operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecognized series name or dump filename.
    #[error("invalid series format: {0}")]
    InvalidSeries(String),

    /// Metadata attribute missing or of the wrong type.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Missing or incomplete configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Logical channel name not present in the connection table.
    #[error("no connection entry for channel {0:?}")]
    MissingChannel(String),

    /// Logical channel name maps to more than one physical channel.
    #[error("ambiguous connection entry for channel {0:?}")]
    AmbiguousChannel(String),

    /// Detector settings unavailable for a channel that needs them.
    #[error("no detector settings for channel {0:?}")]
    MissingDetectorSettings(String),
}
