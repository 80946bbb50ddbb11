#![allow(clippy::uninlined_format_args, clippy::cast_precision_loss)]
use approx::assert_relative_eq;
use chrono::{NaiveDate, NaiveTime};
use ndarray::Array2;
use std::path::Path;
use tesdaq_core::{
    AdcChannelConfig, AdcConfig, ConnectionEntry, ConnectionTable, SeriesId,
};
use tesdaq_io::{
    DumpWriter, ReaderConfig, SeriesReader, TraceBlock, WriteOptions, WriterConfig,
};
use tesdaq_trigger::{create_template, TriggerConfig, TriggerEngine, TriggerState};

const FS: f64 = 100_000.0;
const BLOCK_LEN: usize = 4096;
const EVENT_LEN: usize = 256;
const PRETRIGGER: usize = 64;
const COUNTS_PER_VOLT: f64 = 1.0e3;

fn input_series() -> SeriesId {
    SeriesId::new(
        2,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
    )
}

fn output_series() -> SeriesId {
    SeriesId::new(
        2,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
    )
}

fn adc_config() -> AdcConfig {
    let channel = |channel| AdcChannelConfig {
        channel,
        voltage_range: (-5.0, 5.0),
        conversion_factor: vec![1.0 / COUNTS_PER_VOLT, 0.0],
    };
    AdcConfig {
        adc_id: 1,
        sample_rate: FS,
        nb_samples: BLOCK_LEN,
        nb_samples_pretrigger: 0,
        channels: vec![channel(0), channel(1)],
    }
}

fn connections() -> ConnectionTable {
    let mut table = ConnectionTable::new();
    for (channel, tes, detector) in [(0, "A", "Det1"), (1, "B", "Det2")] {
        table.push(ConnectionEntry {
            adc_id: 1,
            adc_channel: channel,
            tes_channel: tes.to_string(),
            detector_channel: detector.to_string(),
            controller_channel: format!("C{channel}"),
        });
    }
    table
}

fn noise_sample(state: &mut u64) -> i16 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    i16::try_from(*state % 5).unwrap() - 2
}

/// Two continuous blocks of mild noise with one template-shaped pulse of
/// known amplitude injected into the second block.
fn write_continuous_input(dir: &Path, pulse_counts: f64, pulse_start: usize) {
    let config = WriterConfig::default().with_rotation_max(1);
    let mut writer = DumpWriter::create(input_series(), dir, config).unwrap();
    writer.set_adc_config(adc_config());
    writer.set_connections(connections());

    let template = create_template(20.0e-6, 80.0e-6, FS, EVENT_LEN, PRETRIGGER).unwrap();
    let mut rng_state = 0x1234_5678_9abc_def0_u64;

    for block_idx in 0..2usize {
        let mut block = Array2::<i16>::zeros((2, BLOCK_LEN));
        for mut row in block.rows_mut() {
            for value in row.iter_mut() {
                *value = noise_sample(&mut rng_state);
            }
        }
        if block_idx == 1 {
            for (i, &t) in template.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let counts = (pulse_counts * t).round() as i16;
                block[[0, pulse_start + i]] += counts;
            }
        }
        let options = WriteOptions {
            event_time: Some(block_idx as f64 * BLOCK_LEN as f64 / FS),
            ..WriteOptions::default()
        };
        writer.write_event(block.view(), &options).unwrap();
    }
    writer.close().unwrap();
}

fn engine_config() -> TriggerConfig {
    TriggerConfig::default()
        .with_event_geometry(EVENT_LEN, PRETRIGGER)
        .with_time_constants(20.0e-6, 80.0e-6)
        .with_nb_events_randoms(20)
        .with_threshold_sigma(10.0)
        .with_rng_seed(7)
}

#[test]
fn test_single_injected_pulse_yields_one_trigger() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let pulse_start = 1000;
    write_continuous_input(input.path(), 2000.0, pulse_start);

    let mut engine = TriggerEngine::new(
        &[input.path()],
        output_series(),
        output.path(),
        engine_config(),
    )
    .unwrap();

    engine.create_template().unwrap();
    let randoms = engine.acquire_randoms().unwrap();
    assert_eq!(randoms.total_chunks, 2 * BLOCK_LEN / EVENT_LEN);
    assert_eq!(randoms.written, 20);
    assert!(randoms.surviving > 0);

    let summary = engine.acquire_trigger(None, None).unwrap();
    assert_eq!(engine.state(), TriggerState::Done);
    assert_eq!(summary.blocks_processed, 2);
    assert_eq!(summary.triggers_written, 1);

    // inspect the derived series
    let mut reader = SeriesReader::new(ReaderConfig::default());
    reader.set_files(&[output.path()], None, None).unwrap();

    let mut trigger_meta = None;
    let mut noise_count = 0;
    while let Some(record) = reader.read_next_event().unwrap() {
        assert_eq!(record.data.channels(), 2);
        assert_eq!(record.data.samples(), EVENT_LEN);
        if record.metadata.contains("trigger_amplitude") {
            trigger_meta = Some(record);
        } else {
            noise_count += 1;
        }
    }
    assert_eq!(noise_count, 20);

    let trigger = trigger_meta.expect("one trigger event expected");
    let amplitude = trigger.metadata.require_float("trigger_amplitude").unwrap();
    let time = trigger.metadata.require_float("trigger_time").unwrap();

    // the pseudo-trace pulse peaks at pulse_counts / counts_per_volt
    assert_relative_eq!(amplitude, 2000.0 / COUNTS_PER_VOLT, max_relative = 0.05);
    let expected_time = (BLOCK_LEN + pulse_start) as f64 / FS;
    assert_relative_eq!(time, expected_time, epsilon = 2.0 / FS);

    // the stored window carries the pulse onset at the pretrigger mark
    let TraceBlock::Counts(counts) = trigger.data else {
        panic!("expected raw counts");
    };
    let peak = counts.row(0).iter().copied().max().unwrap();
    assert!(peak > 1500, "stored window misses the pulse, peak {peak}");
}

#[test]
fn test_randoms_sample_without_replacement() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_continuous_input(input.path(), 0.0, 0);

    let config = engine_config().with_nb_events_randoms(100);
    let mut engine = TriggerEngine::new(
        &[input.path()],
        output_series(),
        output.path(),
        config,
    )
    .unwrap();
    engine.create_template().unwrap();
    let randoms = engine.acquire_randoms().unwrap();

    // more requested than available: every chunk selected exactly once
    let total = 2 * BLOCK_LEN / EVENT_LEN;
    assert_eq!(randoms.total_chunks, total);
    assert_eq!(randoms.written, total);

    let mut reader = SeriesReader::new(ReaderConfig::default());
    reader.set_files(&[output.path()], None, None).unwrap();
    let mut sources = Vec::new();
    while let Some(record) = reader.read_next_event().unwrap() {
        let num = record.metadata.require_int("source_event_num").unwrap();
        let offset = record.metadata.require_int("source_offset").unwrap();
        assert_eq!(offset % i64::try_from(EVENT_LEN).unwrap(), 0);
        sources.push((num, offset));
    }
    let unique: std::collections::BTreeSet<_> = sources.iter().collect();
    assert_eq!(unique.len(), sources.len(), "overlapping chunks selected");
    assert_eq!(sources.len(), total);
}

#[test]
fn test_engine_state_machine_rejects_out_of_order_calls() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_continuous_input(input.path(), 0.0, 0);

    let mut engine = TriggerEngine::new(
        &[input.path()],
        output_series(),
        output.path(),
        engine_config(),
    )
    .unwrap();

    assert_eq!(engine.state(), TriggerState::Init);
    assert!(engine.acquire_randoms().is_err());
    assert!(engine.acquire_trigger(None, None).is_err());

    engine.create_template().unwrap();
    assert_eq!(engine.state(), TriggerState::TemplateReady);
    assert!(engine.create_template().is_err());

    engine.acquire_randoms().unwrap();
    assert_eq!(engine.state(), TriggerState::RandomsAcquired);
    assert!(engine.acquire_randoms().is_err());

    engine.acquire_trigger(None, None).unwrap();
    assert_eq!(engine.state(), TriggerState::Done);
    assert!(engine.acquire_trigger(None, None).is_err());
}

#[test]
fn test_filter_bundle_side_car() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_continuous_input(input.path(), 0.0, 0);

    let bundle = output.path().join("filter_bundle.hdf5");
    let config = engine_config().with_filter_file(&bundle);
    let mut engine = TriggerEngine::new(
        &[input.path()],
        output_series(),
        output.path().join("series").as_path(),
        config,
    )
    .unwrap();
    engine.create_template().unwrap();
    engine.acquire_randoms().unwrap();
    engine.acquire_trigger(None, None).unwrap();

    let file = hdf5::File::open(&bundle).unwrap();
    let template = file.dataset("template").unwrap().read_1d::<f64>().unwrap();
    let psd = file.dataset("psd").unwrap().read_1d::<f64>().unwrap();
    assert_eq!(template.len(), EVENT_LEN);
    assert_eq!(psd.len(), EVENT_LEN / 2 + 1);
    let rate: f64 = file.attr("sample_rate").unwrap().read_scalar().unwrap();
    assert_relative_eq!(rate, FS);
}

#[test]
fn test_output_series_is_self_describing() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_continuous_input(input.path(), 2000.0, 500);

    let mut engine = TriggerEngine::new(
        &[input.path()],
        output_series(),
        output.path(),
        engine_config(),
    )
    .unwrap();
    engine.create_template().unwrap();
    engine.acquire_randoms().unwrap();
    engine.acquire_trigger(None, None).unwrap();

    let reader = {
        let mut r = SeriesReader::new(ReaderConfig::default());
        r.set_files(&[output.path()], None, None).unwrap();
        r
    };
    let adc = reader.get_adc_config().unwrap();
    assert_eq!(adc.nb_samples, EVENT_LEN);
    assert_eq!(adc.nb_samples_pretrigger, PRETRIGGER);
    assert_relative_eq!(adc.sample_rate, FS);
    assert_eq!(reader.get_connection_table().unwrap(), connections());
}
