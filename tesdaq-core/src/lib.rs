//! tesdaq-core: Core types for TES waveform storage.
//!
//! This crate provides series addressing, the tagged metadata value model,
//! the channel connection table and per-channel detector settings shared by
//! the storage and trigger crates.
//!

pub mod adc;
pub mod connection;
pub mod detector;
pub mod error;
pub mod metadata;
pub mod series;

pub use adc::{polyval, AdcChannelConfig, AdcConfig};
pub use connection::{ConnectionEntry, ConnectionTable};
pub use detector::{DetectorConfig, DetectorSettings};
pub use error::{Error, Result};
pub use metadata::{keys, MetadataMap, MetadataValue};
pub use series::{parse_dump_file_name, SeriesId, DUMP_EXTENSION};
