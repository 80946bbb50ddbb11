//!
//! Operator CLI over the tesdaq storage and trigger libraries.
#![allow(clippy::uninlined_format_args, clippy::too_many_lines)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tesdaq_core::SeriesId;
use tesdaq_io::{ReaderConfig, SeriesReader};
use tesdaq_trigger::{TriggerConfig, TriggerEngine};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] tesdaq_io::Error),

    #[error("core error: {0}")]
    Core(#[from] tesdaq_core::Error),

    #[error("trigger error: {0}")]
    Trigger(#[from] tesdaq_trigger::Error),
}

/// Waveform container inspection and triggering.
#[derive(Parser)]
#[command(name = "tesdaq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print series, group and event metadata of a dump or directory
    Info {
        /// Dump file or directory of dumps
        path: PathBuf,
    },
    /// Run the randoms and trigger passes over a continuous series
    Trigger {
        /// Input dump file(s) or directories
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// Output directory for the derived series
        #[arg(short, long)]
        output: PathBuf,

        /// Facility number of the derived series
        #[arg(long, default_value_t = 1)]
        facility: u32,

        /// Output event length in samples
        #[arg(long, default_value_t = 4096)]
        length: usize,

        /// Output pretrigger length in samples
        #[arg(long, default_value_t = 1024)]
        pretrigger: usize,

        /// Template rise time in seconds
        #[arg(long, default_value_t = 20.0e-6)]
        rise: f64,

        /// Template fall time in seconds
        #[arg(long, default_value_t = 80.0e-6)]
        fall: f64,

        /// Number of noise chunks for the PSD estimate
        #[arg(long, default_value_t = 500)]
        randoms: usize,

        /// Trigger threshold in sigma above the noise resolution
        #[arg(long, default_value_t = 10.0)]
        threshold: f64,

        /// Stop after this many triggers
        #[arg(long)]
        max_triggers: Option<usize>,

        /// Invert the pulse polarity
        #[arg(long)]
        invert: bool,

        /// Restrict the analysis to these logical channels
        #[arg(long)]
        channel: Vec<String>,

        /// Seed for the randoms shuffle
        #[arg(long)]
        seed: Option<u64>,

        /// Side-car file for the filter bundle
        #[arg(long)]
        filter_file: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Info { path } => run_info(&path),
        Commands::Trigger {
            input,
            output,
            facility,
            length,
            pretrigger,
            rise,
            fall,
            randoms,
            threshold,
            max_triggers,
            invert,
            channel,
            seed,
            filter_file,
        } => run_trigger(TriggerArgs {
            input,
            output,
            facility,
            length,
            pretrigger,
            rise,
            fall,
            randoms,
            threshold,
            max_triggers,
            invert,
            channel,
            seed,
            filter_file,
        }),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run_info(path: &Path) -> Result<()> {
    let mut reader = SeriesReader::new(ReaderConfig::default());
    reader.set_files(&[path], None, None)?;

    let metadata = reader.get_metadata()?;
    println!("series:   {}", metadata.series);
    println!("dump:     {}", metadata.dump_num);
    println!("files:    {}", reader.files().len());
    for (name, value) in metadata.file.iter() {
        println!("  {name} = {value}");
    }
    for (group, attrs) in &metadata.groups {
        println!("group {group}:");
        for (name, value) in attrs.iter() {
            println!("  {name} = {value}");
        }
    }

    let connections = reader.get_connection_table()?;
    for entry in connections.iter() {
        println!(
            "channel {}: tes {} / detector {} / controller {}",
            entry.adc_channel, entry.tes_channel, entry.detector_channel,
            entry.controller_channel
        );
    }
    Ok(())
}

struct TriggerArgs {
    input: Vec<PathBuf>,
    output: PathBuf,
    facility: u32,
    length: usize,
    pretrigger: usize,
    rise: f64,
    fall: f64,
    randoms: usize,
    threshold: f64,
    max_triggers: Option<usize>,
    invert: bool,
    channel: Vec<String>,
    seed: Option<u64>,
    filter_file: Option<PathBuf>,
}

fn run_trigger(args: TriggerArgs) -> Result<()> {
    let mut config = TriggerConfig::default()
        .with_event_geometry(args.length, args.pretrigger)
        .with_time_constants(args.rise, args.fall)
        .with_nb_events_randoms(args.randoms)
        .with_threshold_sigma(args.threshold)
        .with_inverted_polarity(args.invert);
    if let Some(max) = args.max_triggers {
        config = config.with_max_triggers(max);
    }
    if let Some(seed) = args.seed {
        config = config.with_rng_seed(seed);
    }
    if let Some(path) = args.filter_file {
        config = config.with_filter_file(path);
    }
    if !args.channel.is_empty() {
        let names: Vec<&str> = args.channel.iter().map(String::as_str).collect();
        config = config.with_channels(&names);
    }

    let output_series = SeriesId::from_datetime(args.facility, chrono::Utc::now().naive_utc());
    let mut engine =
        TriggerEngine::new(&args.input, output_series, &args.output, config)?;

    engine.create_template()?;
    let randoms = engine.acquire_randoms()?;
    println!(
        "randoms: wrote {} of {} chunks, {} survive the pileup cut",
        randoms.written, randoms.total_chunks, randoms.surviving
    );

    let summary = engine.acquire_trigger(None, None)?;
    println!(
        "trigger: wrote {} events over {} blocks into series {}",
        summary.triggers_written, summary.blocks_processed, output_series
    );
    Ok(())
}
