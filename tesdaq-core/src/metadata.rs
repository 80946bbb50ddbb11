//! Tagged metadata values for container attributes.
//!
//! Container files carry attributes at the file, group and dataset levels.
//! [`MetadataValue`] is the tagged variant type those attributes decode
//! into; [`MetadataMap`] is an ordered name → value map with fail-clear
//! typed accessors.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Standard attribute names of the container format.
pub mod keys {
    /// File level: numeric series key.
    pub const SERIES_NUM: &str = "series_num";
    /// File level: dump number within the series.
    pub const DUMP_NUM: &str = "dump_num";
    /// File level: dataset name prefix.
    pub const PREFIX: &str = "prefix";
    /// File level: free-form comment.
    pub const COMMENT: &str = "comment";
    /// File level: facility number.
    pub const FACILITY: &str = "facility";
    /// File level: fridge run number.
    pub const FRIDGE_RUN: &str = "fridge_run";
    /// File level: acquisition software version.
    pub const DAQ_VERSION: &str = "daq_version";
    /// File level: container format version.
    pub const FORMAT_VERSION: &str = "format_version";
    /// File level: run type tag.
    pub const RUN_TYPE: &str = "run_type";
    /// File level: run purpose text.
    pub const RUN_PURPOSE: &str = "run_purpose";

    /// Group level: ADC sampling rate in Hz.
    pub const SAMPLE_RATE: &str = "sample_rate";
    /// Group level: samples per event.
    pub const NB_SAMPLES: &str = "nb_samples";
    /// Group level: pretrigger samples per event.
    pub const NB_SAMPLES_PRETRIGGER: &str = "nb_samples_pretrigger";
    /// Group level: committed event count.
    pub const NB_EVENTS: &str = "nb_events";
    /// Group level, per physical channel: `voltage_range{channel}`.
    pub const VOLTAGE_RANGE_PREFIX: &str = "voltage_range";
    /// Group level, per physical channel: `adc_conversion_factor{channel}`.
    pub const ADC_CONVERSION_PREFIX: &str = "adc_conversion_factor";
    /// Group level, per physical channel: `connection{channel}`.
    pub const CONNECTION_PREFIX: &str = "connection";

    /// Dataset level: globally monotonic event id.
    pub const EVENT_ID: &str = "event_id";
    /// Dataset level: 1-based index within the dump.
    pub const EVENT_INDEX: &str = "event_index";
    /// Dataset level: composite `dump*100000 + index` number.
    pub const EVENT_NUM: &str = "event_num";
    /// Dataset level: acquisition timestamp, seconds since the epoch.
    pub const EVENT_TIME: &str = "event_time";
    /// Dataset level: absolute trigger time in seconds.
    pub const TRIGGER_TIME: &str = "trigger_time";
    /// Dataset level: fitted pulse amplitude.
    pub const TRIGGER_AMPLITUDE: &str = "trigger_amplitude";

    /// Group naming: ADC groups are `adc{id}`.
    pub const ADC_GROUP_PREFIX: &str = "adc";
    /// Group naming: detector settings groups are `detconfig{id}`.
    pub const DETCONFIG_GROUP_PREFIX: &str = "detconfig";
}

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One attribute value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MetadataValue {
    Int(i64),
    Float(f64),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl MetadataValue {
    /// Returns the integer value, if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a float; integers are widened.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the string value, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the value as a float array; scalars and integer arrays are
    /// widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float_array(&self) -> Option<Vec<f64>> {
        match self {
            Self::FloatArray(v) => Some(v.clone()),
            Self::IntArray(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Self::Float(v) => Some(vec![*v]),
            Self::Int(v) => Some(vec![*v as f64]),
            _ => None,
        }
    }

    /// Returns the string array value, if this is a `StrArray`.
    #[must_use]
    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            Self::StrArray(v) => Some(v),
            _ => None,
        }
    }

    /// Best-effort coercion to a string form.
    ///
    /// Used when staging non-string metadata into attributes that are
    /// stored as text; never fails.
    #[must_use]
    pub fn coerce_str(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::IntArray(v) => join(f, v),
            Self::FloatArray(v) => join(f, v),
            Self::StrArray(v) => join(f, v),
        }
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<i64>> for MetadataValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntArray(v)
    }
}

impl From<Vec<f64>> for MetadataValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatArray(v)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        Self::StrArray(v)
    }
}

/// Ordered attribute map for one file, group or dataset level.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataMap {
    entries: BTreeMap<String, MetadataValue>,
}

impl MetadataMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an attribute.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetadataValue>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Looks up an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.entries.get(name)
    }

    /// Returns true if the attribute is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Removes an attribute, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<MetadataValue> {
        self.entries.remove(name)
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merges `other` into `self`, overriding existing names.
    pub fn extend(&mut self, other: &Self) {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
    }

    /// Returns the named integer attribute.
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the attribute is absent or not an
    /// integer.
    pub fn require_int(&self, name: &str) -> Result<i64> {
        self.get(name)
            .and_then(MetadataValue::as_int)
            .ok_or_else(|| Error::Metadata(format!("missing integer attribute {name:?}")))
    }

    /// Returns the named float attribute (integers are widened).
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the attribute is absent or not
    /// numeric.
    pub fn require_float(&self, name: &str) -> Result<f64> {
        self.get(name)
            .and_then(MetadataValue::as_float)
            .ok_or_else(|| Error::Metadata(format!("missing numeric attribute {name:?}")))
    }

    /// Returns the named string attribute.
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the attribute is absent or not a
    /// string.
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.get(name)
            .and_then(MetadataValue::as_str)
            .ok_or_else(|| Error::Metadata(format!("missing string attribute {name:?}")))
    }

    /// Returns the named float-array attribute (integer arrays widened).
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if the attribute is absent or not an
    /// array of numbers.
    pub fn require_float_array(&self, name: &str) -> Result<Vec<f64>> {
        self.get(name)
            .and_then(MetadataValue::as_float_array)
            .ok_or_else(|| Error::Metadata(format!("missing array attribute {name:?}")))
    }
}

impl FromIterator<(String, MetadataValue)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (String, MetadataValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let mut map = MetadataMap::new();
        map.insert("sample_rate", 1_250_000.0);
        map.insert("nb_samples", 4096i64);
        map.insert("comment", "calibration run");

        assert_eq!(map.require_float("sample_rate").unwrap(), 1_250_000.0);
        assert_eq!(map.require_int("nb_samples").unwrap(), 4096);
        assert_eq!(map.require_str("comment").unwrap(), "calibration run");
        // integers widen to float, floats do not narrow to int
        assert_eq!(map.require_float("nb_samples").unwrap(), 4096.0);
        assert!(map.require_int("sample_rate").is_err());
    }

    #[test]
    fn test_missing_attribute_is_an_error_not_a_sentinel() {
        let map = MetadataMap::new();
        let err = map.require_float("sample_rate").unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn test_array_widening() {
        let mut map = MetadataMap::new();
        map.insert("adc_conversion_factor", vec![1i64, 2, 3]);
        assert_eq!(
            map.require_float_array("adc_conversion_factor").unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_coerce_str() {
        assert_eq!(MetadataValue::Int(7).coerce_str(), "7");
        assert_eq!(
            MetadataValue::FloatArray(vec![1.5, 2.5]).coerce_str(),
            "1.5,2.5"
        );
    }

    #[test]
    fn test_extend_overrides() {
        let mut base = MetadataMap::new();
        base.insert("nb_events", 10i64);
        let mut patch = MetadataMap::new();
        patch.insert("nb_events", 20i64);
        base.extend(&patch);
        assert_eq!(base.require_int("nb_events").unwrap(), 20);
    }
}
