//! ADC configuration consumed from the acquisition layer.
//!
//! Sample geometry and per-channel calibration arrive from the DAQ card
//! configuration; the writer stamps them onto each ADC group and the
//! reader rebuilds them from the group attributes, so a dump never needs
//! the external configuration to be interpreted.

use crate::error::{Error, Result};
use crate::metadata::{keys, MetadataMap, MetadataValue};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Calibration of one physical ADC channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdcChannelConfig {
    /// Physical channel index on the device.
    pub channel: u32,
    /// Input voltage range (low, high).
    pub voltage_range: (f64, f64),
    /// Counts → volts polynomial coefficients, highest order first.
    pub conversion_factor: Vec<f64>,
}

/// Configuration of one ADC device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdcConfig {
    /// ADC device id; the containing group is named `adc{id}`.
    pub adc_id: u32,
    /// Sampling rate in Hz.
    pub sample_rate: f64,
    /// Samples per stored event.
    pub nb_samples: usize,
    /// Pretrigger samples per stored event.
    pub nb_samples_pretrigger: usize,
    /// Connected channels, ascending by physical index.
    pub channels: Vec<AdcChannelConfig>,
}

impl AdcConfig {
    /// Evaluates the counts → volts polynomial of one connected channel row.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `row` has no calibration.
    pub fn counts_to_volts(&self, row: usize, counts: f64) -> Result<f64> {
        let channel = self
            .channels
            .get(row)
            .ok_or_else(|| Error::Config(format!("no calibration for channel row {row}")))?;
        Ok(polyval(&channel.conversion_factor, counts))
    }

    /// Encodes the configuration into ADC group attributes.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_attributes(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert(keys::SAMPLE_RATE, self.sample_rate);
        map.insert(keys::NB_SAMPLES, self.nb_samples as i64);
        map.insert(
            keys::NB_SAMPLES_PRETRIGGER,
            self.nb_samples_pretrigger as i64,
        );
        for ch in &self.channels {
            map.insert(
                format!("{}{}", keys::VOLTAGE_RANGE_PREFIX, ch.channel),
                vec![ch.voltage_range.0, ch.voltage_range.1],
            );
            map.insert(
                format!("{}{}", keys::ADC_CONVERSION_PREFIX, ch.channel),
                ch.conversion_factor.clone(),
            );
        }
        map
    }

    /// Rebuilds the configuration from ADC group attributes.
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the sample geometry is missing or a
    /// per-channel attribute is malformed.
    #[allow(clippy::cast_sign_loss)]
    pub fn from_attributes(adc_id: u32, attrs: &MetadataMap) -> Result<Self> {
        let sample_rate = attrs.require_float(keys::SAMPLE_RATE)?;
        let nb_samples = attrs.require_int(keys::NB_SAMPLES)? as usize;
        let nb_samples_pretrigger = attrs.require_int(keys::NB_SAMPLES_PRETRIGGER)? as usize;

        let mut channels = Vec::new();
        for (name, value) in attrs.iter() {
            let Some(channel) = name.strip_prefix(keys::ADC_CONVERSION_PREFIX) else {
                continue;
            };
            let Ok(channel) = channel.parse::<u32>() else {
                continue;
            };
            let conversion_factor = value.as_float_array().ok_or_else(|| {
                Error::Metadata(format!("attribute {name:?} is not a numeric array"))
            })?;
            let range = attrs
                .require_float_array(&format!("{}{}", keys::VOLTAGE_RANGE_PREFIX, channel))?;
            let voltage_range = match range.as_slice() {
                [lo, hi] => (*lo, *hi),
                _ => {
                    return Err(Error::Metadata(format!(
                        "voltage range of channel {channel} must have two values"
                    )))
                }
            };
            channels.push(AdcChannelConfig {
                channel,
                voltage_range,
                conversion_factor,
            });
        }
        channels.sort_by_key(|c| c.channel);

        Ok(Self {
            adc_id,
            sample_rate,
            nb_samples,
            nb_samples_pretrigger,
            channels,
        })
    }
}

/// Evaluates a polynomial with coefficients ordered highest first.
#[must_use]
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().fold(0.0, |acc, &c| acc * x + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> AdcConfig {
        AdcConfig {
            adc_id: 1,
            sample_rate: 1_250_000.0,
            nb_samples: 4096,
            nb_samples_pretrigger: 1024,
            channels: vec![
                AdcChannelConfig {
                    channel: 0,
                    voltage_range: (-5.0, 5.0),
                    conversion_factor: vec![3.05e-4, 0.0],
                },
                AdcChannelConfig {
                    channel: 3,
                    voltage_range: (-2.0, 2.0),
                    conversion_factor: vec![1.0e-8, 1.22e-4, -0.5],
                },
            ],
        }
    }

    #[test]
    fn test_polyval_highest_first() {
        assert_relative_eq!(polyval(&[2.0, 3.0, 4.0], 10.0), 234.0);
        assert_relative_eq!(polyval(&[], 10.0), 0.0);
    }

    #[test]
    fn test_counts_to_volts() {
        let cfg = config();
        assert_relative_eq!(cfg.counts_to_volts(0, 1000.0).unwrap(), 0.305);
        assert_relative_eq!(
            cfg.counts_to_volts(1, 1000.0).unwrap(),
            1.0e-8 * 1.0e6 + 1.22e-4 * 1000.0 - 0.5
        );
        assert!(cfg.counts_to_volts(2, 1.0).is_err());
    }

    #[test]
    fn test_attribute_roundtrip() {
        let cfg = config();
        let rebuilt = AdcConfig::from_attributes(1, &cfg.to_attributes()).unwrap();
        assert_eq!(rebuilt, cfg);
    }
}
