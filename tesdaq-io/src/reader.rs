//! Series reader: streaming cursor, random access and batch reads.
//!
//! A reader walks one or many dumps as a single logical series. The
//! sequential cursor opens the next dump transparently; end of data is
//! `Ok(None)`, never an error, since callers rely on it for loop
//! termination. Unit conversion happens on read and is never persisted.

use crate::attrs::read_attrs;
use crate::{Error, Result};
use log::{debug, warn};
use ndarray::{s, Array2, Array3, Axis};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tesdaq_core::{
    keys, parse_dump_file_name, AdcConfig, ConnectionTable, DetectorConfig, MetadataMap, SeriesId,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DEFAULT_MEMORY_CEILING: u64 = 4 * 1024 * 1024 * 1024;
const RAW_BYTES_PER_SAMPLE: u64 = 2;
const CONVERTED_BYTES_PER_SAMPLE: u64 = 8;

/// Units of returned sample blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Units {
    /// Raw ADC counts.
    #[default]
    Counts,
    /// Volts at the output stage, via the calibration polynomial.
    Volts,
    /// TES current amps, volts divided by the close-loop normalization.
    Amps,
}

/// What to do on configuration and format errors in batch operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorPolicy {
    /// Propagate the error to the caller.
    #[default]
    Raise,
    /// Log a warning and return what was read so far.
    Warn,
}

/// Baseline subtraction window in sample indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BaselineWindow {
    /// First sample of the window.
    pub start: usize,
    /// One past the last sample; `None` means 80% of the pretrigger.
    pub stop: Option<usize>,
}

impl Default for BaselineWindow {
    fn default() -> Self {
        Self {
            start: 10,
            stop: None,
        }
    }
}

/// Static reader configuration.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Units of returned blocks.
    pub units: Units,
    /// Baseline subtraction window; `None` disables subtraction.
    pub baseline: Option<BaselineWindow>,
    /// Memory ceiling for batch reads, in bytes.
    pub memory_ceiling_bytes: u64,
    /// Failure mode for batch operations.
    pub error_policy: ErrorPolicy,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            units: Units::Counts,
            baseline: None,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING,
            error_policy: ErrorPolicy::Raise,
        }
    }
}

impl ReaderConfig {
    /// Set the units of returned blocks.
    #[must_use]
    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    /// Enable baseline subtraction over the given window.
    #[must_use]
    pub fn with_baseline(mut self, window: BaselineWindow) -> Self {
        self.baseline = Some(window);
        self
    }

    /// Set the batch-read memory ceiling in bytes.
    #[must_use]
    pub fn with_memory_ceiling_bytes(mut self, bytes: u64) -> Self {
        self.memory_ceiling_bytes = bytes;
        self
    }

    /// Set the failure mode for batch operations.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Explicit per-event selection across a series.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    entries: BTreeSet<(u64, u64)>,
}

impl EventFilter {
    /// Creates an empty filter; an empty filter admits nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits one event of one series by its composite event number.
    pub fn add(&mut self, series: SeriesId, event_num: u64) {
        self.entries.insert((series.key(), event_num));
    }

    /// Number of admitted events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allows(&self, series: SeriesId, dump_num: u32, event_index: u32) -> bool {
        let event_num = u64::from(dump_num) * 100_000 + u64::from(event_index);
        self.entries.contains(&(series.key(), event_num))
    }
}

/// One event's samples in the configured units.
#[derive(Clone, Debug)]
pub enum TraceBlock {
    /// Raw ADC counts.
    Counts(Array2<i16>),
    /// Unit-converted samples (volts or amps).
    Physical(Array2<f64>),
}

impl TraceBlock {
    /// Number of channel rows.
    #[must_use]
    pub fn channels(&self) -> usize {
        match self {
            Self::Counts(a) => a.nrows(),
            Self::Physical(a) => a.nrows(),
        }
    }

    /// Number of samples per channel.
    #[must_use]
    pub fn samples(&self) -> usize {
        match self {
            Self::Counts(a) => a.ncols(),
            Self::Physical(a) => a.ncols(),
        }
    }

    /// In-memory size of the block.
    #[must_use]
    pub fn nbytes(&self) -> u64 {
        let samples = (self.channels() * self.samples()) as u64;
        match self {
            Self::Counts(_) => samples * RAW_BYTES_PER_SAMPLE,
            Self::Physical(_) => samples * CONVERTED_BYTES_PER_SAMPLE,
        }
    }

    /// Returns the samples as floats, widening counts when needed.
    #[must_use]
    pub fn to_physical(&self) -> Array2<f64> {
        match self {
            Self::Counts(a) => a.mapv(f64::from),
            Self::Physical(a) => a.clone(),
        }
    }
}

/// One event read from a dump.
#[derive(Clone, Debug)]
pub struct EventRecord {
    /// Sample block in the configured units.
    pub data: TraceBlock,
    /// Dataset-level attributes of the event.
    pub metadata: MetadataMap,
    /// Series the event belongs to.
    pub series: SeriesId,
    /// Dump the event was read from.
    pub dump_num: u32,
}

/// File- and group-level metadata of one dump.
#[derive(Clone, Debug)]
pub struct DumpMetadata {
    /// Path of the dump file.
    pub path: PathBuf,
    /// Series identity parsed from the filename.
    pub series: SeriesId,
    /// Dump number parsed from the filename.
    pub dump_num: u32,
    /// File-level attributes.
    pub file: MetadataMap,
    /// Group-level attributes by group name.
    pub groups: BTreeMap<String, MetadataMap>,
}

struct OpenDump {
    path: PathBuf,
    group: hdf5::Group,
    series: SeriesId,
    dump_num: u32,
    adc: AdcConfig,
    connections: ConnectionTable,
    detector: Option<DetectorConfig>,
    file_meta: MetadataMap,
    group_meta: MetadataMap,
    group_name: String,
    /// (event_index, dataset name), ascending by index.
    events: Vec<(u32, String)>,
    file: hdf5::File,
}

fn open_dump(path: &Path) -> Result<OpenDump> {
    let (series, dump_num) = parse_dump_file_name(&path.to_string_lossy())?;
    let file = hdf5::File::open(path)?;
    let file_meta = read_attrs(&file)?;

    let mut adc_group = None;
    for name in file.member_names()? {
        if let Some(id) = name.strip_prefix(keys::ADC_GROUP_PREFIX) {
            if let Ok(adc_id) = id.parse::<u32>() {
                adc_group = Some((name, adc_id));
                break;
            }
        }
    }
    let (group_name, adc_id) = adc_group.ok_or_else(|| {
        Error::InvalidFormat(format!("no ADC group in {}", path.display()))
    })?;
    let group = file.group(&group_name)?;
    let group_meta = read_attrs(&group)?;
    let adc = AdcConfig::from_attributes(adc_id, &group_meta)?;
    let connections = ConnectionTable::from_attributes(adc_id, &group_meta)?;

    let det_name = format!("{}{}", keys::DETCONFIG_GROUP_PREFIX, adc_id);
    let detector = if file.member_names()?.contains(&det_name) {
        let det_attrs = read_attrs(&file.group(&det_name)?)?;
        Some(DetectorConfig::from_attributes(&det_attrs)?)
    } else {
        None
    };

    let mut events = Vec::new();
    for name in group.member_names()? {
        if let Some((_, index)) = name.rsplit_once('_') {
            if let Ok(index) = index.parse::<u32>() {
                events.push((index, name));
            }
        }
    }
    events.sort();

    Ok(OpenDump {
        path: path.to_path_buf(),
        group,
        series,
        dump_num,
        adc,
        connections,
        detector,
        file_meta,
        group_meta,
        group_name,
        events,
        file,
    })
}

/// Reader over one logical series of dumps.
pub struct SeriesReader {
    config: ReaderConfig,
    files: Vec<PathBuf>,
    event_filter: Option<EventFilter>,
    channels: Option<Vec<String>>,
    cursor_file: usize,
    cursor_event: usize,
    current: Option<OpenDump>,
}

impl SeriesReader {
    /// Creates a reader with the given configuration and no files.
    #[must_use]
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            config,
            files: Vec::new(),
            event_filter: None,
            channels: None,
            cursor_file: 0,
            cursor_event: 0,
            current: None,
        }
    }

    /// Sets the input files and resets the cursor.
    ///
    /// Directories are expanded to their `*.hdf5` entries. Files are
    /// ordered lexically, which the naming convention makes chronological.
    ///
    /// # Errors
    /// Returns an error for a missing path or an unrecognized dump name;
    /// with [`ErrorPolicy::Warn`] those are logged and skipped instead.
    pub fn set_files<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        series_filter: Option<SeriesId>,
        event_filter: Option<EventFilter>,
    ) -> Result<()> {
        let mut expanded: Vec<PathBuf> = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                for entry in fs::read_dir(path)? {
                    let entry = entry?.path();
                    if entry.extension().and_then(|e| e.to_str())
                        == Some(tesdaq_core::DUMP_EXTENSION)
                    {
                        expanded.push(entry);
                    }
                }
            } else if path.is_file() {
                expanded.push(path.to_path_buf());
            } else {
                let err = Error::Config(format!("input path {} not found", path.display()));
                if self.config.error_policy == ErrorPolicy::Raise {
                    return Err(err);
                }
                warn!("{err}");
            }
        }

        let mut files = Vec::new();
        for path in expanded {
            match parse_dump_file_name(&path.to_string_lossy()) {
                Ok((series, _)) => {
                    if series_filter.is_none_or(|f| f == series) {
                        files.push(path);
                    }
                }
                Err(err) => {
                    if self.config.error_policy == ErrorPolicy::Raise {
                        return Err(err.into());
                    }
                    warn!("skipping {}: {err}", path.display());
                }
            }
        }
        files.sort();

        self.files = files;
        self.event_filter = event_filter;
        self.rewind();
        Ok(())
    }

    /// Input files in read order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Restricts returned rows to the given logical channel names.
    ///
    /// Resolution happens against each dump's own connection map at read
    /// time, so the selection survives across dumps.
    pub fn select_channels(&mut self, names: &[&str]) {
        self.channels = Some(names.iter().map(ToString::to_string).collect());
    }

    /// Clears the channel selection.
    pub fn clear_channel_selection(&mut self) {
        self.channels = None;
    }

    /// Resets the sequential cursor to the first event of the first file.
    pub fn rewind(&mut self) {
        self.cursor_file = 0;
        self.cursor_event = 0;
        self.current = None;
    }

    /// Reads the next event of the series.
    ///
    /// Returns `Ok(None)` at end of data; the next dump of the series is
    /// opened transparently.
    ///
    /// # Errors
    /// Returns an error on container I/O failure or broken unit
    /// conversion inputs.
    pub fn read_next_event(&mut self) -> Result<Option<EventRecord>> {
        loop {
            if self.current.is_none() {
                if self.cursor_file >= self.files.len() {
                    return Ok(None);
                }
                let dump = open_dump(&self.files[self.cursor_file])?;
                debug!(
                    "opened dump {} with {} events",
                    dump.path.display(),
                    dump.events.len()
                );
                self.current = Some(dump);
                self.cursor_event = 0;
            }

            let Some(dump) = self.current.as_ref() else {
                return Ok(None);
            };
            let Some((event_index, name)) = dump.events.get(self.cursor_event).cloned() else {
                self.current = None;
                self.cursor_file += 1;
                continue;
            };
            self.cursor_event += 1;

            if let Some(filter) = &self.event_filter {
                if !filter.allows(dump.series, dump.dump_num, event_index) {
                    continue;
                }
            }
            let record = read_event(dump, &name, None, self.channels.as_deref(), &self.config)?;
            return Ok(Some(record));
        }
    }

    /// Reads one event by index without moving the sequential cursor.
    ///
    /// With `file` given, that dump is opened on the side; otherwise the
    /// currently open dump (or the first file) is used.
    ///
    /// # Errors
    /// Returns an error if the event does not exist or cannot be read.
    pub fn read_single_event(&self, event_index: u32, file: Option<&Path>) -> Result<EventRecord> {
        self.read_windowed(event_index, None, file)
    }

    /// Reads a sample window of one event via a partial on-disk read.
    ///
    /// The window `[start, start + len)` must lie inside the stored
    /// block; the full block is never loaded.
    ///
    /// # Errors
    /// Returns an error if the window falls outside the stored block.
    pub fn read_event_window(
        &self,
        event_index: u32,
        start: usize,
        len: usize,
        file: Option<&Path>,
    ) -> Result<EventRecord> {
        self.read_windowed(event_index, Some((start, len)), file)
    }

    fn with_dump<R>(
        &self,
        file: Option<&Path>,
        f: impl FnOnce(&OpenDump) -> Result<R>,
    ) -> Result<R> {
        match file {
            Some(path) => f(&open_dump(path)?),
            None => match &self.current {
                Some(dump) => f(dump),
                None => {
                    let first = self
                        .files
                        .first()
                        .ok_or_else(|| Error::Config("no input files set".to_string()))?;
                    f(&open_dump(first)?)
                }
            },
        }
    }

    fn read_windowed(
        &self,
        event_index: u32,
        window: Option<(usize, usize)>,
        file: Option<&Path>,
    ) -> Result<EventRecord> {
        self.with_dump(file, |dump| {
            let name = event_dataset_name(dump, event_index)?;
            read_event(dump, &name, window, self.channels.as_deref(), &self.config)
        })
    }

    /// Reads up to `max_events` as a list; shapes may differ per event.
    ///
    /// The configured memory ceiling truncates the request with a warning
    /// instead of failing.
    ///
    /// # Errors
    /// Returns an error on the first failed read with
    /// [`ErrorPolicy::Raise`]; with [`ErrorPolicy::Warn`] the events read
    /// so far are returned.
    pub fn read_many_events(&mut self, max_events: usize) -> Result<Vec<EventRecord>> {
        let max_events = self.apply_memory_ceiling(max_events, self.bytes_per_sample())?;
        let mut records = Vec::new();
        while records.len() < max_events {
            match self.read_next_event() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(err) => {
                    if self.config.error_policy == ErrorPolicy::Raise {
                        return Err(err);
                    }
                    warn!("stopping batch read: {err}");
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Reads events into a preallocated `[event, channel, sample]` array.
    ///
    /// All selected events must share the array's channel and sample
    /// counts; a shape mismatch is a format error. Returns the number of
    /// filled slots and the per-event metadata.
    ///
    /// # Errors
    /// Returns an error when an event's shape disagrees with the array.
    pub fn read_many_into(
        &mut self,
        out: &mut Array3<f64>,
    ) -> Result<(usize, Vec<MetadataMap>)> {
        let (capacity, channels, samples) = out.dim();
        let capacity =
            self.apply_memory_ceiling_shaped(capacity, channels, samples, CONVERTED_BYTES_PER_SAMPLE)?;

        let mut metadata = Vec::new();
        let mut filled = 0;
        while filled < capacity {
            let record = match self.read_next_event() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    if self.config.error_policy == ErrorPolicy::Raise {
                        return Err(err);
                    }
                    warn!("stopping batch read: {err}");
                    break;
                }
            };
            let block = record.data.to_physical();
            if block.dim() != (channels, samples) {
                let err = Error::InvalidFormat(format!(
                    "event shape {:?} does not match batch shape ({channels}, {samples})",
                    block.dim()
                ));
                if self.config.error_policy == ErrorPolicy::Raise {
                    return Err(err);
                }
                warn!("{err}");
                break;
            }
            out.slice_mut(s![filled, .., ..]).assign(&block);
            metadata.push(record.metadata);
            filled += 1;
        }
        Ok((filled, metadata))
    }

    /// File- and group-level metadata of the current (or first) dump.
    ///
    /// # Errors
    /// Returns an error if no files are set or the dump cannot be opened.
    pub fn get_metadata(&self) -> Result<DumpMetadata> {
        self.with_dump(None, |dump| {
            let mut groups = BTreeMap::new();
            groups.insert(dump.group_name.clone(), dump.group_meta.clone());
            let det_name = format!("{}{}", keys::DETCONFIG_GROUP_PREFIX, dump.adc.adc_id);
            if let Ok(det_group) = dump.file.group(&det_name) {
                groups.insert(det_name, read_attrs(&det_group)?);
            }
            Ok(DumpMetadata {
                path: dump.path.clone(),
                series: dump.series,
                dump_num: dump.dump_num,
                file: dump.file_meta.clone(),
                groups,
            })
        })
    }

    /// Dataset-level metadata of one event, reloaded from disk.
    ///
    /// # Errors
    /// Returns an error if the event does not exist.
    pub fn get_event_metadata(&self, event_index: u32) -> Result<MetadataMap> {
        self.with_dump(None, |dump| {
            let name = event_dataset_name(dump, event_index)?;
            read_attrs(&dump.group.dataset(&name)?)
        })
    }

    /// Connection table derived from the current (or first) dump itself.
    ///
    /// # Errors
    /// Returns an error if no files are set or the dump cannot be opened.
    pub fn get_connection_table(&self) -> Result<ConnectionTable> {
        self.with_dump(None, |dump| Ok(dump.connections.clone()))
    }

    /// Detector settings derived from the current (or first) dump itself.
    ///
    /// # Errors
    /// Returns an error if no files are set or the dump cannot be opened.
    pub fn get_detector_config(&self) -> Result<Option<DetectorConfig>> {
        self.with_dump(None, |dump| Ok(dump.detector.clone()))
    }

    /// ADC configuration derived from the current (or first) dump itself.
    ///
    /// # Errors
    /// Returns an error if no files are set or the dump cannot be opened.
    pub fn get_adc_config(&self) -> Result<AdcConfig> {
        self.with_dump(None, |dump| Ok(dump.adc.clone()))
    }

    /// Event indices stored in one file, ascending.
    ///
    /// # Errors
    /// Returns an error if the dump cannot be opened.
    pub fn event_indices(&self, file: &Path) -> Result<Vec<u32>> {
        self.with_dump(Some(file), |dump| {
            Ok(dump.events.iter().map(|(index, _)| *index).collect())
        })
    }

    /// Shape `(channels, samples)` of one event of one file, read from
    /// the dataset extent only.
    ///
    /// # Errors
    /// Returns an error if the event does not exist or is not 2-D.
    pub fn dataset_shape(&self, file: &Path, event_index: u32) -> Result<(usize, usize)> {
        self.with_dump(Some(file), |dump| {
            let name = event_dataset_name(dump, event_index)?;
            let shape = dump.group.dataset(&name)?.shape();
            match shape.as_slice() {
                [channels, samples] => Ok((*channels, *samples)),
                other => Err(Error::InvalidFormat(format!(
                    "event dataset is {}-D, expected 2-D",
                    other.len()
                ))),
            }
        })
    }

    fn bytes_per_sample(&self) -> u64 {
        match self.config.units {
            Units::Counts => RAW_BYTES_PER_SAMPLE,
            Units::Volts | Units::Amps => CONVERTED_BYTES_PER_SAMPLE,
        }
    }

    fn apply_memory_ceiling(&self, requested: usize, bytes_per_sample: u64) -> Result<usize> {
        if self.files.is_empty() || requested == 0 {
            return Ok(requested);
        }
        // Estimate from the first unread event's stored extent.
        let file = &self.files[self.cursor_file.min(self.files.len() - 1)];
        let dump = open_dump(file)?;
        let Some((_, name)) = dump.events.first() else {
            return Ok(requested);
        };
        let shape = dump.group.dataset(name)?.shape();
        let [channels, samples] = shape.as_slice() else {
            return Err(Error::InvalidFormat(format!(
                "event dataset {name:?} is not 2-D"
            )));
        };
        let channels = self.channels.as_ref().map_or(*channels, Vec::len);
        self.truncate_to_ceiling(requested, channels, *samples, bytes_per_sample)
    }

    fn apply_memory_ceiling_shaped(
        &self,
        requested: usize,
        channels: usize,
        samples: usize,
        bytes_per_sample: u64,
    ) -> Result<usize> {
        self.truncate_to_ceiling(requested, channels, samples, bytes_per_sample)
    }

    fn truncate_to_ceiling(
        &self,
        requested: usize,
        channels: usize,
        samples: usize,
        bytes_per_sample: u64,
    ) -> Result<usize> {
        let bytes_per_event = (channels * samples) as u64 * bytes_per_sample;
        if bytes_per_event == 0 {
            return Ok(requested);
        }
        let allowed = usize::try_from(self.config.memory_ceiling_bytes / bytes_per_event)
            .unwrap_or(usize::MAX);
        if requested > allowed {
            warn!(
                "truncating batch read from {requested} to {allowed} events \
                 ({bytes_per_event} bytes/event, ceiling {} bytes)",
                self.config.memory_ceiling_bytes
            );
            Ok(allowed)
        } else {
            Ok(requested)
        }
    }
}

fn event_dataset_name(dump: &OpenDump, event_index: u32) -> Result<String> {
    dump.events
        .iter()
        .find(|(index, _)| *index == event_index)
        .map(|(_, name)| name.clone())
        .ok_or_else(|| {
            Error::InvalidFormat(format!(
                "event {event_index} not found in {}",
                dump.path.display()
            ))
        })
}

fn read_event(
    dump: &OpenDump,
    dataset_name: &str,
    window: Option<(usize, usize)>,
    channels: Option<&[String]>,
    config: &ReaderConfig,
) -> Result<EventRecord> {
    let dataset = dump.group.dataset(dataset_name)?;
    let metadata = read_attrs(&dataset)?;

    let shape = dataset.shape();
    let [nrows, ncols] = shape.as_slice() else {
        return Err(Error::InvalidFormat(format!(
            "event dataset {dataset_name:?} is not 2-D"
        )));
    };
    let raw: Array2<i16> = match window {
        Some((start, len)) => {
            if start + len > *ncols {
                return Err(Error::InvalidFormat(format!(
                    "window [{start}, {}) outside stored block of {ncols} samples",
                    start + len
                )));
            }
            dataset.read_slice_2d::<i16, _>(s![.., start..start + len])?
        }
        None => dataset.read_2d::<i16>()?,
    };

    let rows: Vec<usize> = match channels {
        Some(names) => names
            .iter()
            .map(|name| dump.connections.row_index(dump.adc.adc_id, name))
            .collect::<tesdaq_core::Result<Vec<_>>>()?,
        None => (0..*nrows).collect(),
    };
    let raw = raw.select(Axis(0), &rows);

    let data = match config.units {
        Units::Counts => TraceBlock::Counts(raw),
        units => TraceBlock::Physical(convert_rows(dump, &raw, &rows, units, config)?),
    };

    Ok(EventRecord {
        data,
        metadata,
        series: dump.series,
        dump_num: dump.dump_num,
    })
}

fn convert_rows(
    dump: &OpenDump,
    raw: &Array2<i16>,
    rows: &[usize],
    units: Units,
    config: &ReaderConfig,
) -> Result<Array2<f64>> {
    let mut out = Array2::<f64>::zeros(raw.dim());
    for (out_row, &row) in rows.iter().enumerate() {
        let channel = dump.adc.channels.get(row).ok_or_else(|| {
            Error::Config(format!("no calibration for channel row {row}"))
        })?;
        let norm = match units {
            Units::Amps => {
                let entry = dump
                    .connections
                    .by_adc(dump.adc.adc_id, channel.channel)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "no connection entry for physical channel {}",
                            channel.channel
                        ))
                    })?;
                let detector = dump.detector.as_ref().ok_or_else(|| {
                    Error::Config("amps requested but dump has no detector settings".to_string())
                })?;
                detector.close_loop_norm(&entry.detector_channel)?
            }
            _ => 1.0,
        };
        for (out_val, &count) in out
            .row_mut(out_row)
            .iter_mut()
            .zip(raw.row(out_row).iter())
        {
            let volts = tesdaq_core::polyval(&channel.conversion_factor, f64::from(count));
            *out_val = volts / norm;
        }
    }

    if let Some(baseline) = config.baseline {
        subtract_baseline(&mut out, baseline, dump.adc.nb_samples_pretrigger)?;
    }
    Ok(out)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn subtract_baseline(
    block: &mut Array2<f64>,
    window: BaselineWindow,
    pretrigger: usize,
) -> Result<()> {
    let stop = window
        .stop
        .unwrap_or_else(|| (0.8 * pretrigger as f64) as usize);
    if window.start >= stop || stop > block.ncols() {
        return Err(Error::Config(format!(
            "baseline window [{}, {stop}) invalid for {} samples",
            window.start,
            block.ncols()
        )));
    }
    let len = (stop - window.start) as f64;
    for mut row in block.rows_mut() {
        let mean: f64 = row.slice(s![window.start..stop]).sum() / len;
        row.mapv_inplace(|v| v - mean);
    }
    Ok(())
}
