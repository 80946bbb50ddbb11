//! tesdaq-io: HDF5 container I/O for TES waveform series.
//!
//! This crate provides the dump writer (rotation, per-event durability)
//! and the series reader (streaming cursor, random access, batch reads,
//! unit conversion).
//!

pub mod attrs;
mod error;
mod reader;
mod writer;

pub use error::{Error, Result};
pub use reader::{
    BaselineWindow, DumpMetadata, ErrorPolicy, EventFilter, EventRecord, ReaderConfig,
    SeriesReader, TraceBlock, Units,
};
pub use writer::{DumpWriter, EventInfo, WriteOptions, WriterConfig, FORMAT_VERSION};
