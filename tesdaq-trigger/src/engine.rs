//! Single-pass trigger engine over a continuous series.
//!
//! The engine mines a continuous, untriggered acquisition in two passes:
//! `acquire_randoms` samples noise chunks across the whole series and
//! estimates the noise PSD; `acquire_trigger` streams the series through
//! the optimum filter and carves threshold crossings into fixed-length
//! trigger events. One engine instance performs one pass over one input
//! series and is not resumable.

use crate::filter::OptimumFilter;
use crate::psd::{fold_psd, pileup_cut, NoisePsd};
use crate::template;
use crate::{Error, Result};
use log::{debug, warn};
use ndarray::{concatenate, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tesdaq_core::{keys, MetadataMap, MetadataValue, SeriesId};
use tesdaq_io::{
    DumpWriter, EventRecord, ReaderConfig, SeriesReader, TraceBlock, Units, WriteOptions,
    WriterConfig,
};

/// Dataset prefix of noise (randoms) events.
pub const NOISE_PREFIX: &str = "noise";
/// Dataset prefix of threshold-triggered events.
pub const TRIGGER_PREFIX: &str = "trigger";

/// Engine life cycle; transitions are one-way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerState {
    Init,
    TemplateReady,
    RandomsAcquired,
    Triggering,
    Done,
}

/// Static trigger engine configuration.
#[derive(Clone, Debug)]
pub struct TriggerConfig {
    /// Output event length in samples; must be even.
    pub nb_samples: usize,
    /// Output pretrigger length in samples.
    pub nb_samples_pretrigger: usize,
    /// Template rise time in seconds.
    pub rise_time: f64,
    /// Template fall time in seconds.
    pub fall_time: f64,
    /// Number of noise chunks to sample across the series.
    pub nb_events_randoms: usize,
    /// Trigger threshold in units of the filter's amplitude resolution.
    pub threshold_sigma: f64,
    /// Stop after this many triggers; `None` runs to end of input.
    pub max_triggers: Option<usize>,
    /// Invert the pulse polarity before analysis and storage.
    pub invert_polarity: bool,
    /// Pileup cut strength in standard deviations of the trace range.
    pub pileup_cut_sigma: f64,
    /// Logical channel selection; `None` uses every connected channel.
    pub channels: Option<Vec<String>>,
    /// Seed for the randoms chunk shuffle; `None` draws from entropy.
    pub rng_seed: Option<u64>,
    /// Side-car file for the filter bundle (template + PSD).
    pub filter_file: Option<PathBuf>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            nb_samples: 4096,
            nb_samples_pretrigger: 1024,
            rise_time: 20.0e-6,
            fall_time: 80.0e-6,
            nb_events_randoms: 500,
            threshold_sigma: 10.0,
            max_triggers: None,
            invert_polarity: false,
            pileup_cut_sigma: 2.0,
            channels: None,
            rng_seed: None,
            filter_file: None,
        }
    }
}

impl TriggerConfig {
    /// Set the output event geometry.
    #[must_use]
    pub fn with_event_geometry(mut self, nb_samples: usize, nb_samples_pretrigger: usize) -> Self {
        self.nb_samples = nb_samples;
        self.nb_samples_pretrigger = nb_samples_pretrigger;
        self
    }

    /// Set the template time constants in seconds.
    #[must_use]
    pub fn with_time_constants(mut self, rise_time: f64, fall_time: f64) -> Self {
        self.rise_time = rise_time;
        self.fall_time = fall_time;
        self
    }

    /// Set the number of noise chunks to sample.
    #[must_use]
    pub fn with_nb_events_randoms(mut self, nb: usize) -> Self {
        self.nb_events_randoms = nb;
        self
    }

    /// Set the trigger threshold in sigma.
    #[must_use]
    pub fn with_threshold_sigma(mut self, nsigma: f64) -> Self {
        self.threshold_sigma = nsigma;
        self
    }

    /// Stop after `max` triggers.
    #[must_use]
    pub fn with_max_triggers(mut self, max: usize) -> Self {
        self.max_triggers = Some(max);
        self
    }

    /// Invert the pulse polarity.
    #[must_use]
    pub fn with_inverted_polarity(mut self, invert: bool) -> Self {
        self.invert_polarity = invert;
        self
    }

    /// Restrict the analysis to the given logical channels.
    #[must_use]
    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        self.channels = Some(channels.iter().map(ToString::to_string).collect());
        self
    }

    /// Seed the randoms shuffle for reproducible sampling.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Persist the filter bundle to a side-car file.
    #[must_use]
    pub fn with_filter_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.filter_file = Some(path.into());
        self
    }
}

/// Outcome of the randoms pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RandomsSummary {
    /// Noise events written out.
    pub written: usize,
    /// Traces surviving the pileup cut and entering the PSD.
    pub surviving: usize,
    /// Non-overlapping chunks available across the whole series.
    pub total_chunks: usize,
}

/// Outcome of the trigger pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerSummary {
    /// Trigger events written out.
    pub triggers_written: usize,
    /// Continuous blocks streamed.
    pub blocks_processed: usize,
}

struct BlockRef {
    path: PathBuf,
    event_index: u32,
    len: usize,
    abs_start: u64,
}

/// Trigger engine over one continuous input series.
pub struct TriggerEngine {
    config: TriggerConfig,
    raw_reader: SeriesReader,
    phys_reader: SeriesReader,
    writer: DumpWriter,
    state: TriggerState,
    sample_rate: f64,
    template: Option<Vec<f64>>,
    psd: Option<NoisePsd>,
}

impl TriggerEngine {
    /// Creates an engine over `input_paths`, writing derived events as
    /// `output_series` under `output_dir`.
    ///
    /// Sample rate, connection map and detector settings are discovered
    /// from the first input dump and propagated to the output, with the
    /// sample geometry overridden to the configured event shape.
    ///
    /// # Errors
    /// Returns an error for empty input, bad geometry, or unreadable
    /// input metadata.
    pub fn new<P: AsRef<Path>>(
        input_paths: &[P],
        output_series: SeriesId,
        output_dir: &Path,
        config: TriggerConfig,
    ) -> Result<Self> {
        if config.nb_samples == 0 || config.nb_samples % 2 != 0 {
            return Err(Error::Config(format!(
                "event length {} must be even and non-zero",
                config.nb_samples
            )));
        }
        if config.nb_samples_pretrigger >= config.nb_samples {
            return Err(Error::Config(format!(
                "pretrigger {} must lie inside the {}-sample event",
                config.nb_samples_pretrigger, config.nb_samples
            )));
        }
        if config.threshold_sigma <= 0.0 {
            return Err(Error::Config("threshold must be positive".to_string()));
        }

        let mut raw_reader = SeriesReader::new(ReaderConfig::default());
        raw_reader.set_files(input_paths, None, None)?;
        let mut phys_reader = SeriesReader::new(ReaderConfig::default().with_units(Units::Volts));
        phys_reader.set_files(input_paths, None, None)?;
        if raw_reader.files().is_empty() {
            return Err(Error::Config("no input dump files".to_string()));
        }

        let adc = raw_reader.get_adc_config()?;
        let connections = raw_reader.get_connection_table()?;

        // Row order is ascending by physical channel; sort any selection
        // the same way so written blocks match the propagated map.
        let mut out_adc = adc.clone();
        let mut out_connections = connections.clone();
        if let Some(selection) = &config.channels {
            let mut resolved = Vec::new();
            for name in selection {
                let entry = connections.resolve(name)?;
                resolved.push((entry.adc_channel, entry.clone()));
            }
            resolved.sort_by_key(|(channel, _)| *channel);

            let names: Vec<&str> = resolved
                .iter()
                .map(|(_, e)| e.detector_channel.as_str())
                .collect();
            raw_reader.select_channels(&names);
            phys_reader.select_channels(&names);

            out_connections = tesdaq_core::ConnectionTable::new();
            let selected: Vec<u32> = resolved.iter().map(|(channel, _)| *channel).collect();
            for (_, entry) in resolved {
                out_connections.push(entry);
            }
            out_adc
                .channels
                .retain(|c| selected.contains(&c.channel));
        }
        out_adc.nb_samples = config.nb_samples;
        out_adc.nb_samples_pretrigger = config.nb_samples_pretrigger;

        let input_meta = raw_reader.get_metadata()?;
        let mut file_meta = MetadataMap::new();
        for key in [
            keys::COMMENT,
            keys::FACILITY,
            keys::FRIDGE_RUN,
            keys::DAQ_VERSION,
            keys::RUN_TYPE,
            keys::RUN_PURPOSE,
        ] {
            if let Some(value) = input_meta.file.get(key) {
                file_meta.insert(key, value.clone());
            }
        }

        // carry custom ADC group attributes over, dropping everything the
        // output geometry and channel subset will restate
        let mut group_meta = MetadataMap::new();
        if let Some(input_group) = input_meta
            .groups
            .get(&format!("{}{}", keys::ADC_GROUP_PREFIX, adc.adc_id))
        {
            for (name, value) in input_group.iter() {
                let restated = name == keys::SAMPLE_RATE
                    || name == keys::NB_SAMPLES
                    || name == keys::NB_SAMPLES_PRETRIGGER
                    || name == keys::NB_EVENTS
                    || name.starts_with(keys::VOLTAGE_RANGE_PREFIX)
                    || name.starts_with(keys::ADC_CONVERSION_PREFIX)
                    || name.starts_with(keys::CONNECTION_PREFIX);
                if !restated {
                    group_meta.insert(name, value.clone());
                }
            }
        }

        let writer_config = WriterConfig::default().with_adc_id(adc.adc_id);
        let mut writer = DumpWriter::create(output_series, output_dir, writer_config)?;
        writer.set_file_metadata(file_meta);
        writer.set_group_metadata(group_meta);
        writer.set_adc_config(out_adc);
        writer.set_connections(out_connections);
        if let Some(detector) = raw_reader.get_detector_config()? {
            writer.set_detector_config(detector);
        }

        Ok(Self {
            config,
            raw_reader,
            phys_reader,
            writer,
            state: TriggerState::Init,
            sample_rate: adc.sample_rate,
            template: None,
            psd: None,
        })
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Noise PSD estimated by the randoms pass, if available.
    #[must_use]
    pub fn noise_psd(&self) -> Option<&NoisePsd> {
        self.psd.as_ref()
    }

    /// Builds the double-exponential template from the configured time
    /// constants at the discovered sample rate.
    ///
    /// # Errors
    /// Returns a state error outside `Init` and a configuration error
    /// for unusable time constants.
    pub fn create_template(&mut self) -> Result<&[f64]> {
        if self.state != TriggerState::Init {
            return Err(Error::State(format!(
                "create_template called in {:?} state",
                self.state
            )));
        }
        let template = template::create_template(
            self.config.rise_time,
            self.config.fall_time,
            self.sample_rate,
            self.config.nb_samples,
            self.config.nb_samples_pretrigger,
        )?;
        self.template = Some(template);
        self.state = TriggerState::TemplateReady;
        Ok(self.template.as_deref().unwrap_or_default())
    }

    /// Samples noise chunks across the series and estimates the PSD.
    ///
    /// The full (file, block, chunk) address space of non-overlapping
    /// chunks is shuffled uniformly and the first `nb_events_randoms`
    /// kept, so sampling is without replacement over the whole series.
    /// Each chunk is written out as a traceable noise event and its
    /// channel-summed pseudo-trace enters the pileup cut and PSD.
    ///
    /// # Errors
    /// Returns [`Error::DataQuality`] if no usable noise trace survives.
    pub fn acquire_randoms(&mut self) -> Result<RandomsSummary> {
        if self.state != TriggerState::TemplateReady {
            return Err(Error::State(format!(
                "acquire_randoms called in {:?} state",
                self.state
            )));
        }
        let n = self.config.nb_samples;
        let files: Vec<PathBuf> = self.raw_reader.files().to_vec();

        let mut addresses = Vec::new();
        for (file_idx, path) in files.iter().enumerate() {
            for event_index in self.raw_reader.event_indices(path)? {
                let (_, samples) = self.raw_reader.dataset_shape(path, event_index)?;
                for chunk in 0..samples / n {
                    addresses.push((file_idx, event_index, chunk));
                }
            }
        }
        let total_chunks = addresses.len();

        let mut rng = match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        addresses.shuffle(&mut rng);
        addresses.truncate(self.config.nb_events_randoms);
        addresses.sort_unstable();
        debug!(
            "selected {} of {} noise chunks",
            addresses.len(),
            total_chunks
        );

        let mut pseudo_traces = Vec::with_capacity(addresses.len());
        for &(file_idx, event_index, chunk) in &addresses {
            let path = &files[file_idx];
            let start = chunk * n;
            let raw = self
                .raw_reader
                .read_event_window(event_index, start, n, Some(path))?;
            let phys = self
                .phys_reader
                .read_event_window(event_index, start, n, Some(path))?;

            let counts = self.oriented_counts(&raw)?;
            let base_time = attr_float(&raw.metadata, keys::EVENT_TIME).unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let event_time = base_time + start as f64 / self.sample_rate;

            let mut extra = MetadataMap::new();
            if let Some(num) = raw.metadata.get(keys::EVENT_NUM) {
                extra.insert("source_event_num", num.clone());
            }
            extra.insert("source_offset", as_attr_int(start)?);
            let options = WriteOptions {
                prefix: Some(NOISE_PREFIX.to_string()),
                event_time: Some(event_time),
                metadata: Some(extra),
            };
            self.writer.write_event(counts.view(), &options)?;

            pseudo_traces.push(self.pseudo_trace(&phys));
        }

        let kept = pileup_cut(&pseudo_traces, self.config.pileup_cut_sigma);
        if kept.is_empty() {
            return Err(Error::DataQuality(
                "zero usable noise traces after the pileup cut".to_string(),
            ));
        }
        debug!(
            "{} of {} noise traces survive the pileup cut",
            kept.len(),
            pseudo_traces.len()
        );
        let surviving: Vec<Vec<f64>> = kept.iter().map(|&i| pseudo_traces[i].clone()).collect();
        self.psd = Some(fold_psd(&surviving, self.sample_rate)?);
        self.state = TriggerState::RandomsAcquired;
        Ok(RandomsSummary {
            written: pseudo_traces.len(),
            surviving: kept.len(),
            total_chunks,
        })
    }

    /// Streams the series through the optimum filter and writes trigger
    /// events for threshold crossings.
    ///
    /// `template` and `noise_psd` override the engine's own, decoupling
    /// the randoms pass from triggering. Consecutive blocks are filtered
    /// with one event length of overlap, so pulses straddling block
    /// boundaries are not missed.
    ///
    /// # Errors
    /// Returns a state error when neither a computed nor an override
    /// template/PSD is available.
    pub fn acquire_trigger(
        &mut self,
        template: Option<&[f64]>,
        noise_psd: Option<&NoisePsd>,
    ) -> Result<TriggerSummary> {
        match self.state {
            TriggerState::RandomsAcquired => {}
            TriggerState::TemplateReady | TriggerState::Init
                if noise_psd.is_some() || self.psd.is_some() => {}
            other => {
                return Err(Error::State(format!(
                    "acquire_trigger called in {other:?} state without a noise PSD"
                )))
            }
        }
        let template: Vec<f64> = match template {
            Some(t) => t.to_vec(),
            None => self
                .template
                .clone()
                .ok_or_else(|| Error::State("no template created or provided".to_string()))?,
        };
        let psd: NoisePsd = match noise_psd {
            Some(p) => p.clone(),
            None => self
                .psd
                .clone()
                .ok_or_else(|| Error::State("no noise PSD acquired or provided".to_string()))?,
        };
        if template.len() != self.config.nb_samples {
            return Err(Error::Config(format!(
                "template of {} samples does not match the {}-sample event geometry",
                template.len(),
                self.config.nb_samples
            )));
        }
        self.state = TriggerState::Triggering;

        if let Some(path) = self.config.filter_file.clone() {
            self.write_filter_bundle(&path, &template, &psd)?;
        }

        let event_len = self.config.nb_samples;
        let mut filters: HashMap<usize, OptimumFilter> = HashMap::new();
        let dump_paths = self.dump_path_map();

        self.phys_reader.rewind();
        let mut carry: Vec<f64> = Vec::new();
        let mut prev_block: Option<BlockRef> = None;
        let mut abs_start: u64 = 0;
        let mut last_trigger_abs: Option<u64> = None;
        let min_separation = (event_len / 2) as u64;
        let mut triggers = 0usize;
        let mut blocks = 0usize;

        let mut pending = self.phys_reader.read_next_event()?;
        'stream: while let Some(record) = pending {
            let next = self.phys_reader.read_next_event()?;
            let is_last = next.is_none();
            pending = next;

            let pseudo = self.pseudo_trace(&record);
            let block_len = pseudo.len();
            if block_len < event_len {
                warn!("skipping {block_len}-sample block shorter than the event length");
                abs_start += block_len as u64;
                carry.clear();
                prev_block = None;
                continue;
            }
            blocks += 1;

            #[allow(clippy::cast_sign_loss)]
            let event_index = record.metadata.require_int(keys::EVENT_INDEX)? as u32;
            let path = dump_paths
                .get(&(record.series.key(), record.dump_num))
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no input file for dump {} of series {}",
                        record.dump_num, record.series
                    ))
                })?;
            let block_time = attr_float(&record.metadata, keys::EVENT_TIME).unwrap_or(0.0);
            let block_ref = BlockRef {
                path,
                event_index,
                len: block_len,
                abs_start,
            };

            let carry_len = carry.len();
            let mut extended = std::mem::take(&mut carry);
            extended.extend_from_slice(&pseudo);
            let len = extended.len();

            let (amps, threshold) = {
                let filter = match filters.entry(len) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        entry.insert(OptimumFilter::new(&template, &psd, len)?)
                    }
                };
                (
                    filter.filter_block(&extended)?,
                    self.config.threshold_sigma * filter.sigma_amplitude(),
                )
            };

            // Peaks in the last event length are deferred to the next
            // block, which sees them again through the carried overlap.
            let accept_end = if is_last { len } else { len - event_len };
            let abs_ext_start = abs_start - carry_len as u64;

            let mut peaks: Vec<(usize, f64)> = Vec::new();
            let mut region: Option<(usize, f64)> = None;
            for (idx, &amp) in amps.iter().enumerate().take(accept_end) {
                if amp > threshold {
                    match &mut region {
                        Some((best_idx, best)) => {
                            if amp > *best {
                                *best_idx = idx;
                                *best = amp;
                            }
                        }
                        None => region = Some((idx, amp)),
                    }
                } else if let Some(peak) = region.take() {
                    peaks.push(peak);
                }
            }
            if let Some((peak_idx, peak_amp)) = region.take() {
                // still rising at the boundary: the true peak is in the
                // deferred zone and the next block will find it whole
                if is_last || peak_idx + 1 < accept_end {
                    peaks.push((peak_idx, peak_amp));
                }
            }

            for (peak_idx, peak_amp) in peaks {
                let abs_peak = abs_ext_start + peak_idx as u64;
                if last_trigger_abs
                    .is_some_and(|last| abs_peak.saturating_sub(last) < min_separation)
                {
                    continue;
                }
                if self.emit_trigger(
                    abs_peak,
                    peak_amp,
                    block_time,
                    &block_ref,
                    prev_block.as_ref(),
                )? {
                    triggers += 1;
                    last_trigger_abs = Some(abs_peak);
                }
                if self.config.max_triggers.is_some_and(|max| triggers >= max) {
                    break 'stream;
                }
            }

            carry = pseudo[block_len - event_len..].to_vec();
            prev_block = Some(block_ref);
            abs_start += block_len as u64;
        }

        self.state = TriggerState::Done;
        debug!("trigger pass wrote {triggers} events over {blocks} blocks");
        Ok(TriggerSummary {
            triggers_written: triggers,
            blocks_processed: blocks,
        })
    }

    /// Extracts and writes one trigger-relative window; returns whether
    /// an event was written.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn emit_trigger(
        &mut self,
        abs_peak: u64,
        amplitude: f64,
        block_time: f64,
        block: &BlockRef,
        prev: Option<&BlockRef>,
    ) -> Result<bool> {
        let event_len = self.config.nb_samples;
        let pretrigger = self.config.nb_samples_pretrigger;

        let window_start = abs_peak as i64 - pretrigger as i64;
        if window_start < 0 {
            debug!("dropping trigger at sample {abs_peak}: window before stream start");
            return Ok(false);
        }
        #[allow(clippy::cast_sign_loss)]
        let window_start = window_start as u64;

        let counts = if window_start >= block.abs_start {
            let local = usize::try_from(window_start - block.abs_start)
                .map_err(|_| Error::Config("window offset overflow".to_string()))?;
            if local + event_len > block.len {
                debug!("dropping trigger at sample {abs_peak}: window past stream end");
                return Ok(false);
            }
            let raw = self.raw_reader.read_event_window(
                block.event_index,
                local,
                event_len,
                Some(&block.path),
            )?;
            self.oriented_counts(&raw)?
        } else {
            // window straddles the previous stored block
            let Some(prev) = prev else {
                debug!("dropping trigger at sample {abs_peak}: no previous block");
                return Ok(false);
            };
            let head_len = usize::try_from(block.abs_start - window_start)
                .map_err(|_| Error::Config("window offset overflow".to_string()))?;
            if head_len > prev.len || event_len <= head_len {
                debug!("dropping trigger at sample {abs_peak}: window outside stored blocks");
                return Ok(false);
            }
            let head = self.raw_reader.read_event_window(
                prev.event_index,
                prev.len - head_len,
                head_len,
                Some(&prev.path),
            )?;
            let tail = self.raw_reader.read_event_window(
                block.event_index,
                0,
                event_len - head_len,
                Some(&block.path),
            )?;
            let head = self.oriented_counts(&head)?;
            let tail = self.oriented_counts(&tail)?;
            concatenate(Axis(1), &[head.view(), tail.view()])
                .map_err(|e| Error::Config(format!("window concatenation failed: {e}")))?
        };

        let offset = abs_peak as i64 - block.abs_start as i64;
        let trigger_time = block_time + offset as f64 / self.sample_rate;

        let mut extra = MetadataMap::new();
        extra.insert(keys::TRIGGER_TIME, trigger_time);
        extra.insert(keys::TRIGGER_AMPLITUDE, amplitude);
        let options = WriteOptions {
            prefix: Some(TRIGGER_PREFIX.to_string()),
            event_time: Some(trigger_time),
            metadata: Some(extra),
        };
        self.writer.write_event(counts.view(), &options)?;
        Ok(true)
    }

    fn pseudo_trace(&self, record: &EventRecord) -> Vec<f64> {
        let block = record.data.to_physical();
        let sign = if self.config.invert_polarity { -1.0 } else { 1.0 };
        block.sum_axis(Axis(0)).iter().map(|&v| sign * v).collect()
    }

    fn oriented_counts(&self, record: &EventRecord) -> Result<ndarray::Array2<i16>> {
        let counts = match &record.data {
            TraceBlock::Counts(counts) => counts.clone(),
            TraceBlock::Physical(_) => {
                return Err(Error::Config(
                    "raw reader returned converted samples".to_string(),
                ))
            }
        };
        Ok(if self.config.invert_polarity {
            counts.mapv(i16::saturating_neg)
        } else {
            counts
        })
    }

    fn dump_path_map(&self) -> HashMap<(u64, u32), PathBuf> {
        let mut map = HashMap::new();
        for path in self.phys_reader.files() {
            if let Ok((series, dump)) =
                tesdaq_core::parse_dump_file_name(&path.to_string_lossy())
            {
                map.insert((series.key(), dump), path.clone());
            }
        }
        map
    }

    fn write_filter_bundle(
        &self,
        path: &Path,
        template: &[f64],
        psd: &NoisePsd,
    ) -> Result<()> {
        let file = hdf5::File::create(path).map_err(tesdaq_io::Error::from)?;
        tesdaq_io::attrs::write_attr(&file, keys::SAMPLE_RATE, &self.sample_rate.into())?;
        tesdaq_io::attrs::write_attr(
            &file,
            keys::NB_SAMPLES,
            &as_attr_int(self.config.nb_samples)?.into(),
        )?;

        let write_vec = |name: &str, values: &[f64]| -> Result<()> {
            let dataset = file
                .new_dataset::<f64>()
                .shape((values.len(),))
                .create(name)
                .map_err(tesdaq_io::Error::from)?;
            dataset
                .write(ArrayView1::from(values))
                .map_err(tesdaq_io::Error::from)?;
            Ok(())
        };
        write_vec("template", template)?;
        write_vec("psd", &psd.values)?;
        debug!("wrote filter bundle to {}", path.display());
        Ok(())
    }
}

fn attr_float(metadata: &MetadataMap, name: &str) -> Option<f64> {
    metadata.get(name).and_then(MetadataValue::as_float)
}

fn as_attr_int(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Config(format!("value {value} exceeds attribute range")))
}
