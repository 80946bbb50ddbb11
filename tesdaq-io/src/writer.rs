//! Streaming dump writer.
//!
//! Events are appended to the current dump's ADC group and the file is
//! flushed after every event, so a crash loses at most the event being
//! written. After `rotation_max` events the dump is sealed and the next
//! one opened under the same series.

use crate::attrs::{update_int_attr, write_attrs};
use crate::{Error, Result};
use log::debug;
use ndarray::ArrayView2;
use std::fs;
use std::path::{Path, PathBuf};
use tesdaq_core::{keys, AdcConfig, ConnectionTable, DetectorConfig, MetadataMap, SeriesId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Container format version stamped on every dump.
pub const FORMAT_VERSION: &str = "2.1";

/// Static writer configuration.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// Events per dump before rotating to the next file.
    pub rotation_max: u32,
    /// ADC device id; events land in group `adc{id}`.
    pub adc_id: u32,
    /// Default dataset name prefix.
    pub dataset_prefix: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            rotation_max: 1000,
            adc_id: 1,
            dataset_prefix: "event".to_string(),
        }
    }
}

impl WriterConfig {
    /// Set the rotation threshold in events per dump.
    #[must_use]
    pub fn with_rotation_max(mut self, rotation_max: u32) -> Self {
        self.rotation_max = rotation_max;
        self
    }

    /// Set the ADC device id.
    #[must_use]
    pub fn with_adc_id(mut self, adc_id: u32) -> Self {
        self.adc_id = adc_id;
        self
    }

    /// Set the default dataset name prefix.
    #[must_use]
    pub fn with_dataset_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dataset_prefix = prefix.into();
        self
    }
}

/// Per-event write options.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Dataset name prefix override for this event.
    pub prefix: Option<String>,
    /// Acquisition timestamp in seconds since the epoch; defaults to now.
    pub event_time: Option<f64>,
    /// Extra dataset-level attributes.
    pub metadata: Option<MetadataMap>,
}

/// Addressing of one committed event.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventInfo {
    /// Globally monotonic event id, 1-based.
    pub event_id: u64,
    /// 1-based index within the dump.
    pub event_index: u32,
    /// Composite `dump*100000 + index` number.
    pub event_num: u64,
    /// Dump the event landed in.
    pub dump_num: u32,
    /// Dataset name of the event.
    pub dataset: String,
}

struct OpenDump {
    file: hdf5::File,
    group: hdf5::Group,
    dump_num: u32,
    nb_events: u32,
}

/// Writer for one series of dump files.
///
/// Construction validates the output directory, so a writer that exists
/// is always ready to accept events.
pub struct DumpWriter {
    series: SeriesId,
    output_dir: PathBuf,
    config: WriterConfig,
    file_meta: MetadataMap,
    group_meta: MetadataMap,
    adc_config: Option<AdcConfig>,
    connections: Option<ConnectionTable>,
    detector: Option<DetectorConfig>,
    current: Option<OpenDump>,
    next_dump_num: u32,
    next_event_id: u64,
}

impl DumpWriter {
    /// Creates a writer for `series`, creating `output_dir` if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or is not a
    /// directory.
    pub fn create<P: AsRef<Path>>(
        series: SeriesId,
        output_dir: P,
        config: WriterConfig,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        if output_dir.exists() && !output_dir.is_dir() {
            return Err(Error::Config(format!(
                "output path {} is not a directory",
                output_dir.display()
            )));
        }
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            series,
            output_dir,
            config,
            file_meta: MetadataMap::new(),
            group_meta: MetadataMap::new(),
            adc_config: None,
            connections: None,
            detector: None,
            current: None,
            next_dump_num: 1,
            next_event_id: 1,
        })
    }

    /// Series this writer appends to.
    #[must_use]
    pub fn series(&self) -> SeriesId {
        self.series
    }

    /// Total events committed so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.next_event_id - 1
    }

    /// Stages file-level attributes applied to every future dump.
    pub fn set_file_metadata(&mut self, metadata: MetadataMap) {
        self.file_meta = metadata;
    }

    /// Stages extra group-level attributes applied to every future dump.
    ///
    /// Names the ADC configuration or connection map also write are
    /// overridden by those.
    pub fn set_group_metadata(&mut self, metadata: MetadataMap) {
        self.group_meta = metadata;
    }

    /// Stages the ADC configuration written to every future dump's group.
    pub fn set_adc_config(&mut self, config: AdcConfig) {
        self.adc_config = Some(config);
    }

    /// Stages the channel connection map.
    pub fn set_connections(&mut self, connections: ConnectionTable) {
        self.connections = Some(connections);
    }

    /// Stages the detector settings written as a `detconfig` group.
    pub fn set_detector_config(&mut self, detector: DetectorConfig) {
        self.detector = Some(detector);
    }

    /// Appends one event, rotating dumps when the threshold is reached.
    ///
    /// # Errors
    /// Returns an error on container I/O failure, on a channel count that
    /// disagrees with the staged connection map, or when a dump would
    /// exceed the `event_num` index capacity.
    pub fn write_event(
        &mut self,
        samples: ArrayView2<'_, i16>,
        options: &WriteOptions,
    ) -> Result<EventInfo> {
        if let Some(connections) = &self.connections {
            let expected = connections.adc_channels(self.config.adc_id).len();
            if expected > 0 && samples.nrows() != expected {
                return Err(Error::InvalidFormat(format!(
                    "event has {} channel rows, connection map has {expected}",
                    samples.nrows()
                )));
            }
        }

        if self
            .current
            .as_ref()
            .is_some_and(|d| d.nb_events >= self.config.rotation_max)
        {
            self.seal_current()?;
        }
        if self.current.is_none() {
            self.open_next_dump()?;
        }
        let dump = self.current.as_mut().ok_or_else(|| {
            Error::InvalidFormat("no open dump after rotation".to_string())
        })?;

        let event_index = dump.nb_events + 1;
        if u64::from(event_index) >= 100_000 {
            return Err(Error::InvalidFormat(format!(
                "event_index {event_index} exceeds the per-dump capacity; lower rotation_max"
            )));
        }
        let event_num = u64::from(dump.dump_num) * 100_000 + u64::from(event_index);
        let event_id = self.next_event_id;

        let prefix = options
            .prefix
            .as_deref()
            .unwrap_or(&self.config.dataset_prefix);
        let dataset_name = format!("{prefix}_{event_index}");

        let dataset = dump
            .group
            .new_dataset::<i16>()
            .shape(samples.dim())
            .create(dataset_name.as_str())?;
        dataset.write(samples)?;

        let event_time = options
            .event_time
            .unwrap_or_else(|| timestamp_seconds(chrono::Utc::now()));
        let mut meta = MetadataMap::new();
        meta.insert(keys::EVENT_ID, as_attr_int(event_id)?);
        meta.insert(keys::EVENT_INDEX, i64::from(event_index));
        meta.insert(keys::EVENT_NUM, as_attr_int(event_num)?);
        meta.insert(keys::EVENT_TIME, event_time);
        if let Some(extra) = &options.metadata {
            meta.extend(extra);
        }
        write_attrs(&dataset, &meta)?;

        dump.nb_events = event_index;
        update_int_attr(&dump.group, keys::NB_EVENTS, i64::from(event_index))?;
        dump.file.flush()?;

        self.next_event_id += 1;
        Ok(EventInfo {
            event_id,
            event_index,
            event_num,
            dump_num: dump.dump_num,
            dataset: dataset_name,
        })
    }

    /// Seals the open dump and releases its file handle.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    pub fn close(&mut self) -> Result<()> {
        self.seal_current()
    }

    fn open_next_dump(&mut self) -> Result<()> {
        let dump_num = self.next_dump_num;
        let path = self.output_dir.join(self.series.dump_file_name(dump_num));
        let file = hdf5::File::create(&path)?;

        // staged attributes first, authoritative addressing on top
        let mut file_attrs = self.file_meta.clone();
        file_attrs.insert(keys::SERIES_NUM, as_attr_int(self.series.key())?);
        file_attrs.insert(keys::DUMP_NUM, i64::from(dump_num));
        file_attrs.insert(keys::PREFIX, self.config.dataset_prefix.as_str());
        file_attrs.insert(keys::FORMAT_VERSION, FORMAT_VERSION);
        write_attrs(&file, &file_attrs)?;

        let group_name = format!("{}{}", keys::ADC_GROUP_PREFIX, self.config.adc_id);
        let group = file.create_group(&group_name)?;
        let mut group_attrs = self.group_meta.clone();
        if let Some(adc) = &self.adc_config {
            group_attrs.extend(&adc.to_attributes());
        }
        if let Some(connections) = &self.connections {
            group_attrs.extend(&connections.to_attributes(self.config.adc_id));
        }
        group_attrs.insert(keys::NB_EVENTS, 0i64);
        write_attrs(&group, &group_attrs)?;

        if let Some(detector) = &self.detector {
            let det_name = format!("{}{}", keys::DETCONFIG_GROUP_PREFIX, self.config.adc_id);
            let det_group = file.create_group(&det_name)?;
            write_attrs(&det_group, &detector.to_attributes())?;
        }

        debug!("opened dump {} ({})", dump_num, path.display());
        self.current = Some(OpenDump {
            file,
            group,
            dump_num,
            nb_events: 0,
        });
        self.next_dump_num += 1;
        Ok(())
    }

    fn seal_current(&mut self) -> Result<()> {
        if let Some(dump) = self.current.take() {
            dump.file.flush()?;
            debug!(
                "sealed dump {} with {} events",
                dump.dump_num, dump.nb_events
            );
        }
        Ok(())
    }
}

impl Drop for DumpWriter {
    fn drop(&mut self) {
        if let Err(err) = self.seal_current() {
            log::warn!("failed to seal dump on drop: {err}");
        }
    }
}

fn as_attr_int(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidFormat(format!("value {value} exceeds attribute range")))
}

fn timestamp_seconds(now: chrono::DateTime<chrono::Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let micros = now.timestamp_micros() as f64;
    micros / 1.0e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use ndarray::Array2;
    use tempfile::tempdir;

    fn series() -> SeriesId {
        SeriesId::new(
            2,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        )
    }

    fn block(value: i16) -> Array2<i16> {
        Array2::from_elem((2, 16), value)
    }

    #[test]
    fn test_single_dump_event_numbering() {
        let dir = tempdir().unwrap();
        let mut writer =
            DumpWriter::create(series(), dir.path(), WriterConfig::default()).unwrap();

        for i in 1..=3u32 {
            let info = writer
                .write_event(block(0).view(), &WriteOptions::default())
                .unwrap();
            assert_eq!(info.dump_num, 1);
            assert_eq!(info.event_index, i);
            assert_eq!(info.event_num, 100_000 + u64::from(i));
        }
        writer.close().unwrap();

        assert!(dir
            .path()
            .join("I2_D20240101_T120000_F0001.hdf5")
            .exists());
    }

    #[test]
    fn test_rotation_creates_contiguous_dumps() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::default().with_rotation_max(100);
        let mut writer = DumpWriter::create(series(), dir.path(), config).unwrap();

        let mut last_event_id = 0;
        for _ in 0..150 {
            let info = writer
                .write_event(block(0).view(), &WriteOptions::default())
                .unwrap();
            assert_eq!(info.event_id, last_event_id + 1);
            last_event_id = info.event_id;
        }
        // the 120th event overall lands at index 20 of dump 2
        writer.close().unwrap();

        let f1 = hdf5::File::open(dir.path().join("I2_D20240101_T120000_F0001.hdf5")).unwrap();
        let f2 = hdf5::File::open(dir.path().join("I2_D20240101_T120000_F0002.hdf5")).unwrap();
        let n1: i64 = f1.group("adc1").unwrap().attr("nb_events").unwrap().read_scalar().unwrap();
        let n2: i64 = f2.group("adc1").unwrap().attr("nb_events").unwrap().read_scalar().unwrap();
        assert_eq!((n1, n2), (100, 50));

        let ds = f2.group("adc1").unwrap().dataset("event_20").unwrap();
        let event_num: i64 = ds.attr("event_num").unwrap().read_scalar().unwrap();
        assert_eq!(event_num, 200_020);
    }

    #[test]
    fn test_event_time_and_extra_metadata() {
        let dir = tempdir().unwrap();
        let mut writer =
            DumpWriter::create(series(), dir.path(), WriterConfig::default()).unwrap();

        let mut extra = MetadataMap::new();
        extra.insert(keys::TRIGGER_AMPLITUDE, 3.5e-8);
        let options = WriteOptions {
            prefix: Some("noise".to_string()),
            event_time: Some(1_704_110_400.25),
            metadata: Some(extra),
        };
        let info = writer.write_event(block(1).view(), &options).unwrap();
        assert_eq!(info.dataset, "noise_1");
        writer.close().unwrap();

        let file = hdf5::File::open(dir.path().join("I2_D20240101_T120000_F0001.hdf5")).unwrap();
        let ds = file.group("adc1").unwrap().dataset("noise_1").unwrap();
        let t: f64 = ds.attr("event_time").unwrap().read_scalar().unwrap();
        let amp: f64 = ds.attr("trigger_amplitude").unwrap().read_scalar().unwrap();
        assert_eq!(t, 1_704_110_400.25);
        assert_eq!(amp, 3.5e-8);
    }

    #[test]
    fn test_channel_count_checked_against_connections() {
        let dir = tempdir().unwrap();
        let mut writer =
            DumpWriter::create(series(), dir.path(), WriterConfig::default()).unwrap();

        let mut connections = ConnectionTable::new();
        connections.push(tesdaq_core::ConnectionEntry {
            adc_id: 1,
            adc_channel: 0,
            tes_channel: "A".to_string(),
            detector_channel: "Det1".to_string(),
            controller_channel: "C0".to_string(),
        });
        writer.set_connections(connections);

        let err = writer
            .write_event(block(0).view(), &WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }
}
