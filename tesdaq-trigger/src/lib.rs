//! tesdaq-trigger: Pulse triggering over continuous TES waveform data.
//!
//! This crate turns a continuous, untriggered acquisition into discrete
//! event records: a double-exponential pulse template, a noise PSD
//! estimated from randomly sampled chunks, and an optimum-filter trigger
//! pass with block overlap.
//!

mod engine;
mod error;
mod filter;
mod psd;
mod template;

pub use engine::{
    RandomsSummary, TriggerConfig, TriggerEngine, TriggerState, TriggerSummary, NOISE_PREFIX,
    TRIGGER_PREFIX,
};
pub use error::{Error, Result};
pub use filter::OptimumFilter;
pub use psd::{fold_psd, pileup_cut, NoisePsd};
pub use template::create_template;
