//! Channel connection table: physical ADC channels ↔ logical names.
//!
//! Each ADC group in a dump carries one `connection{channel}` attribute per
//! physical channel, so a stored file can rebuild its own table without any
//! external configuration.

use crate::error::{Error, Result};
use crate::metadata::{keys, MetadataMap, MetadataValue};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One physical ↔ logical channel association.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionEntry {
    /// ADC device id.
    pub adc_id: u32,
    /// Physical channel index on the device (0-based).
    pub adc_channel: u32,
    /// TES readout channel name.
    pub tes_channel: String,
    /// Detector channel name.
    pub detector_channel: String,
    /// Controller channel name.
    pub controller_channel: String,
}

/// Owned table of connection entries for one acquisition.
///
/// Entries are held in an arena `Vec` and addressed by physical or logical
/// identity. Lookups by logical name fail as ambiguous when two entries
/// share the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionTable {
    entries: Vec<ConnectionEntry>,
}

impl ConnectionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    pub fn push(&mut self, entry: ConnectionEntry) {
        self.entries.push(entry);
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all entries.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.iter()
    }

    /// Looks up an entry by physical address.
    #[must_use]
    pub fn by_adc(&self, adc_id: u32, adc_channel: u32) -> Option<&ConnectionEntry> {
        self.entries
            .iter()
            .find(|e| e.adc_id == adc_id && e.adc_channel == adc_channel)
    }

    /// Resolves a logical channel name to its unique entry.
    ///
    /// The name is matched against detector, then TES channel names.
    ///
    /// # Errors
    /// Returns [`Error::MissingChannel`] when no entry matches and
    /// [`Error::AmbiguousChannel`] when more than one does.
    pub fn resolve(&self, name: &str) -> Result<&ConnectionEntry> {
        let matches: Vec<&ConnectionEntry> = self
            .entries
            .iter()
            .filter(|e| e.detector_channel == name)
            .collect();
        let matches = if matches.is_empty() {
            self.entries
                .iter()
                .filter(|e| e.tes_channel == name)
                .collect()
        } else {
            matches
        };
        match matches.as_slice() {
            [] => Err(Error::MissingChannel(name.to_string())),
            [entry] => Ok(entry),
            _ => Err(Error::AmbiguousChannel(name.to_string())),
        }
    }

    /// Physical channel indices of one ADC device, ascending.
    ///
    /// This is the fixed row order of event sample blocks for that device.
    #[must_use]
    pub fn adc_channels(&self, adc_id: u32) -> Vec<u32> {
        let mut channels: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.adc_id == adc_id)
            .map(|e| e.adc_channel)
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Resolves a logical channel name to its sample-block row index.
    ///
    /// # Errors
    /// Returns a channel-mapping error if the name is missing, ambiguous
    /// or connected to a different ADC device.
    pub fn row_index(&self, adc_id: u32, name: &str) -> Result<usize> {
        let entry = self.resolve(name)?;
        if entry.adc_id != adc_id {
            return Err(Error::MissingChannel(name.to_string()));
        }
        self.adc_channels(adc_id)
            .iter()
            .position(|&c| c == entry.adc_channel)
            .ok_or_else(|| Error::MissingChannel(name.to_string()))
    }

    /// Encodes entries of one ADC device into `connection{channel}` group
    /// attributes.
    #[must_use]
    pub fn to_attributes(&self, adc_id: u32) -> MetadataMap {
        let mut map = MetadataMap::new();
        for entry in self.entries.iter().filter(|e| e.adc_id == adc_id) {
            map.insert(
                format!("{}{}", keys::CONNECTION_PREFIX, entry.adc_channel),
                MetadataValue::StrArray(vec![
                    format!("tes:{}", entry.tes_channel),
                    format!("detector:{}", entry.detector_channel),
                    format!("controller:{}", entry.controller_channel),
                ]),
            );
        }
        map
    }

    /// Rebuilds entries of one ADC device from its group attributes.
    ///
    /// Attributes not named `connection{channel}` are ignored.
    ///
    /// # Errors
    /// Returns [`Error::Metadata`] if a connection attribute is malformed.
    pub fn from_attributes(adc_id: u32, attrs: &MetadataMap) -> Result<Self> {
        let mut table = Self::new();
        for (name, value) in attrs.iter() {
            let Some(channel) = name.strip_prefix(keys::CONNECTION_PREFIX) else {
                continue;
            };
            let Ok(adc_channel) = channel.parse::<u32>() else {
                continue;
            };
            let items = value.as_str_array().ok_or_else(|| {
                Error::Metadata(format!("connection attribute {name:?} is not a string array"))
            })?;

            let mut tes = None;
            let mut detector = None;
            let mut controller = None;
            for item in items {
                match item.split_once(':') {
                    Some(("tes", v)) => tes = Some(v.to_string()),
                    Some(("detector", v)) => detector = Some(v.to_string()),
                    Some(("controller", v)) => controller = Some(v.to_string()),
                    _ => {
                        return Err(Error::Metadata(format!(
                            "unrecognized connection item {item:?} in {name:?}"
                        )))
                    }
                }
            }
            let missing =
                || Error::Metadata(format!("incomplete connection attribute {name:?}"));
            table.push(ConnectionEntry {
                adc_id,
                adc_channel,
                tes_channel: tes.ok_or_else(missing)?,
                detector_channel: detector.ok_or_else(missing)?,
                controller_channel: controller.ok_or_else(missing)?,
            });
        }
        table.entries.sort_by_key(|e| (e.adc_id, e.adc_channel));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(adc_channel: u32, tes: &str, detector: &str, controller: &str) -> ConnectionEntry {
        ConnectionEntry {
            adc_id: 1,
            adc_channel,
            tes_channel: tes.to_string(),
            detector_channel: detector.to_string(),
            controller_channel: controller.to_string(),
        }
    }

    fn table() -> ConnectionTable {
        let mut t = ConnectionTable::new();
        t.push(entry(0, "A", "Det1", "C0"));
        t.push(entry(3, "B", "Det2", "C1"));
        t
    }

    #[test]
    fn test_resolve_by_detector_and_tes_names() {
        let t = table();
        assert_eq!(t.resolve("Det2").unwrap().adc_channel, 3);
        assert_eq!(t.resolve("A").unwrap().adc_channel, 0);
        assert!(matches!(
            t.resolve("Det9").unwrap_err(),
            Error::MissingChannel(_)
        ));
    }

    #[test]
    fn test_resolve_ambiguous() {
        let mut t = table();
        t.push(entry(5, "A2", "Det1", "C2"));
        assert!(matches!(
            t.resolve("Det1").unwrap_err(),
            Error::AmbiguousChannel(_)
        ));
    }

    #[test]
    fn test_row_index_follows_channel_order() {
        let t = table();
        assert_eq!(t.row_index(1, "Det1").unwrap(), 0);
        assert_eq!(t.row_index(1, "Det2").unwrap(), 1);
        assert!(t.row_index(2, "Det1").is_err());
    }

    #[test]
    fn test_attribute_roundtrip() {
        let t = table();
        let attrs = t.to_attributes(1);
        assert!(attrs.contains("connection0"));
        assert!(attrs.contains("connection3"));
        let rebuilt = ConnectionTable::from_attributes(1, &attrs).unwrap();
        assert_eq!(rebuilt, t);
    }

    #[test]
    fn test_malformed_attribute_rejected() {
        let mut attrs = MetadataMap::new();
        attrs.insert(
            "connection0",
            MetadataValue::StrArray(vec!["tes:A".to_string(), "bogus".to_string()]),
        );
        assert!(ConnectionTable::from_attributes(1, &attrs).is_err());
    }
}
