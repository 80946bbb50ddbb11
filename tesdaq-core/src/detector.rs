//! Per-channel detector settings and the close-loop normalization.
//!
//! The reader converts output-stage volts to TES current amps by dividing
//! by the close-loop normalization, the product of driver gain, feedback
//! resistance and SQUID turn ratio. Settings are stored per logical
//! detector channel and round-trip through a `detconfig` group so dump
//! files stay self-describing.

use crate::error::{Error, Result};
use crate::metadata::{MetadataMap, MetadataValue};
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const CHANNEL_LIST_ATTR: &str = "channel_list";
const DRIVER_GAIN_ATTR: &str = "driver_gain";
const FEEDBACK_RESISTANCE_ATTR: &str = "feedback_resistance";
const SQUID_TURN_RATIO_ATTR: &str = "squid_turn_ratio";
const FEEDBACK_POLARITY_ATTR: &str = "feedback_polarity";

/// Readout settings of one detector channel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectorSettings {
    /// Output driver gain (V/V).
    pub driver_gain: f64,
    /// Feedback resistance (Ohm).
    pub feedback_resistance: f64,
    /// SQUID input/feedback turn ratio.
    pub squid_turn_ratio: f64,
    /// Feedback loop polarity, +1 or -1.
    pub feedback_polarity: f64,
}

impl DetectorSettings {
    /// Close-loop normalization converting volts to amps.
    #[must_use]
    pub fn close_loop_norm(&self) -> f64 {
        self.feedback_polarity * self.driver_gain * self.feedback_resistance
            * self.squid_turn_ratio
    }
}

/// Detector settings for all logical channels of one acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectorConfig {
    channels: BTreeMap<String, DetectorSettings>,
}

impl DetectorConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces settings for a detector channel.
    pub fn insert(&mut self, channel: impl Into<String>, settings: DetectorSettings) {
        self.channels.insert(channel.into(), settings);
    }

    /// Looks up settings for a channel.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<&DetectorSettings> {
        self.channels.get(channel)
    }

    /// Number of configured channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channels are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterates channels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DetectorSettings)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Close-loop normalization for one channel.
    ///
    /// # Errors
    /// Returns [`Error::MissingDetectorSettings`] when the channel is not
    /// configured, so a missing normalization never silently becomes NaN.
    pub fn close_loop_norm(&self, channel: &str) -> Result<f64> {
        self.channels
            .get(channel)
            .map(DetectorSettings::close_loop_norm)
            .ok_or_else(|| Error::MissingDetectorSettings(channel.to_string()))
    }

    /// Encodes the configuration into `detconfig` group attributes.
    #[must_use]
    pub fn to_attributes(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        let names: Vec<String> = self.channels.keys().cloned().collect();
        let column = |f: fn(&DetectorSettings) -> f64| -> Vec<f64> {
            self.channels.values().map(f).collect()
        };
        map.insert(CHANNEL_LIST_ATTR, MetadataValue::StrArray(names));
        map.insert(DRIVER_GAIN_ATTR, column(|s| s.driver_gain));
        map.insert(FEEDBACK_RESISTANCE_ATTR, column(|s| s.feedback_resistance));
        map.insert(SQUID_TURN_RATIO_ATTR, column(|s| s.squid_turn_ratio));
        map.insert(FEEDBACK_POLARITY_ATTR, column(|s| s.feedback_polarity));
        map
    }

    /// Rebuilds the configuration from `detconfig` group attributes.
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the channel list is missing or any
    /// settings column disagrees with it in length.
    pub fn from_attributes(attrs: &MetadataMap) -> Result<Self> {
        let names = attrs
            .get(CHANNEL_LIST_ATTR)
            .and_then(MetadataValue::as_str_array)
            .ok_or_else(|| {
                Error::Metadata(format!("missing detector {CHANNEL_LIST_ATTR:?} attribute"))
            })?
            .to_vec();

        let column = |name: &str| -> Result<Vec<f64>> {
            let values = attrs.require_float_array(name)?;
            if values.len() != names.len() {
                return Err(Error::Metadata(format!(
                    "detector attribute {name:?} has {} values for {} channels",
                    values.len(),
                    names.len()
                )));
            }
            Ok(values)
        };

        let driver_gain = column(DRIVER_GAIN_ATTR)?;
        let feedback_resistance = column(FEEDBACK_RESISTANCE_ATTR)?;
        let squid_turn_ratio = column(SQUID_TURN_RATIO_ATTR)?;
        let feedback_polarity = column(FEEDBACK_POLARITY_ATTR)?;

        let mut config = Self::new();
        for (i, name) in names.into_iter().enumerate() {
            config.insert(
                name,
                DetectorSettings {
                    driver_gain: driver_gain[i],
                    feedback_resistance: feedback_resistance[i],
                    squid_turn_ratio: squid_turn_ratio[i],
                    feedback_polarity: feedback_polarity[i],
                },
            );
        }
        Ok(config)
    }
}
