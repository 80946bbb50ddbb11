//! Series addressing: acquisition identities and dump filenames.
//!
//! A series is identified by the facility number and the acquisition start
//! timestamp. Its display form is `I{facility}_D{yyyymmdd}_T{hhmmss}`, and
//! each dump file of the series is named `{series}_F{dump:04}.hdf5`.

use crate::error::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// File extension for dump files.
pub const DUMP_EXTENSION: &str = "hdf5";

/// Identity of one acquisition series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SeriesId {
    facility: u32,
    date: NaiveDate,
    time: NaiveTime,
}

impl SeriesId {
    /// Creates a series identity from facility number, date and time.
    ///
    /// Sub-second precision is dropped; series names carry whole seconds.
    #[must_use]
    pub fn new(facility: u32, date: NaiveDate, time: NaiveTime) -> Self {
        let time = time.with_nanosecond(0).unwrap_or(time);
        Self {
            facility,
            date,
            time,
        }
    }

    /// Creates a series identity from an acquisition start timestamp.
    #[must_use]
    pub fn from_datetime(facility: u32, start: NaiveDateTime) -> Self {
        Self::new(facility, start.date(), start.time())
    }

    /// Parses a series name of the form `I{facility}_D{yyyymmdd}_T{hhmmss}`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSeries`] if the name does not match the format.
    pub fn parse(name: &str) -> Result<Self> {
        let bad = || Error::InvalidSeries(name.to_string());

        let mut parts = name.split('_');
        let facility = parts
            .next()
            .and_then(|p| p.strip_prefix('I'))
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(bad)?;
        let date = parts
            .next()
            .and_then(|p| p.strip_prefix('D'))
            .and_then(|p| NaiveDate::parse_from_str(p, "%Y%m%d").ok())
            .ok_or_else(bad)?;
        let time = parts
            .next()
            .and_then(|p| p.strip_prefix('T'))
            .and_then(|p| NaiveTime::parse_from_str(p, "%H%M%S").ok())
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self::new(facility, date, time))
    }

    /// Facility number of this series.
    #[must_use]
    pub fn facility(&self) -> u32 {
        self.facility
    }

    /// Acquisition start timestamp.
    #[must_use]
    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    /// Numeric series key: facility, date and time digits concatenated.
    ///
    /// `I2_D20240101_T120000` maps to `2_20240101_120000` read as one
    /// integer. Chronological order within a facility is preserved.
    #[must_use]
    pub fn key(&self) -> u64 {
        let date = self.date.format("%Y%m%d").to_string();
        let time = self.time.format("%H%M%S").to_string();
        let date: u64 = date.parse().unwrap_or(0);
        let time: u64 = time.parse().unwrap_or(0);
        u64::from(self.facility) * 100_000_000_000_000 + date * 1_000_000 + time
    }

    /// Filename of dump `dump_num` of this series.
    #[must_use]
    pub fn dump_file_name(&self, dump_num: u32) -> String {
        format!("{self}_F{dump_num:04}.{DUMP_EXTENSION}")
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "I{}_D{}_T{}",
            self.facility,
            self.date.format("%Y%m%d"),
            self.time.format("%H%M%S")
        )
    }
}

/// Parses a dump filename into its series identity and dump number.
///
/// Accepts a bare filename or a path; the extension must be `.hdf5`.
///
/// # Errors
/// Returns [`Error::InvalidSeries`] if the name does not match
/// `{series}_F{dump:04}.hdf5`.
pub fn parse_dump_file_name(name: &str) -> Result<(SeriesId, u32)> {
    let bad = || Error::InvalidSeries(name.to_string());

    let base = name
        .rsplit(['/', '\\'])
        .next()
        .and_then(|n| n.strip_suffix(&format!(".{DUMP_EXTENSION}")))
        .ok_or_else(bad)?;
    let (series, dump) = base.rsplit_once("_F").ok_or_else(bad)?;
    let dump_num: u32 = dump.parse().map_err(|_| bad())?;
    if dump_num == 0 {
        return Err(bad());
    }
    let series = SeriesId::parse(series)?;
    Ok((series, dump_num))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> SeriesId {
        SeriesId::new(
            2,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_series_display() {
        assert_eq!(series().to_string(), "I2_D20240101_T120000");
    }

    #[test]
    fn test_series_parse_roundtrip() {
        let s = series();
        assert_eq!(SeriesId::parse(&s.to_string()).unwrap(), s);
    }

    #[test]
    fn test_series_key_concatenates_digits() {
        assert_eq!(series().key(), 2_2024_0101_120000);
    }

    #[test]
    fn test_series_key_is_chronological() {
        let earlier = series();
        let later = SeriesId::new(
            2,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 1).unwrap(),
        );
        assert!(earlier.key() < later.key());
    }

    #[test]
    fn test_dump_file_name() {
        assert_eq!(
            series().dump_file_name(1),
            "I2_D20240101_T120000_F0001.hdf5"
        );
    }

    #[test]
    fn test_parse_dump_file_name() {
        let (s, dump) =
            parse_dump_file_name("/data/run8/I2_D20240101_T120000_F0012.hdf5").unwrap();
        assert_eq!(s, series());
        assert_eq!(dump, 12);
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(SeriesId::parse("I2_D20240101").is_err());
        assert!(SeriesId::parse("X2_D20240101_T120000").is_err());
        assert!(SeriesId::parse("I2_D20241301_T120000").is_err());
        assert!(parse_dump_file_name("I2_D20240101_T120000.hdf5").is_err());
        assert!(parse_dump_file_name("I2_D20240101_T120000_F0000.hdf5").is_err());
    }
}
