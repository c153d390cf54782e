//! CLI Entry Point for daq-stream
//!
//! Provides command-line interface for:
//! - Streaming from the simulated scan device until Enter, Ctrl+C, or a time limit
//! - Checking a configuration file and printing the resulting buffer geometry
//!
//! # Usage
//!
//! Stream with the default configuration:
//! ```bash
//! daq-stream run
//! ```
//!
//! Stream for ten seconds into a CSV file:
//! ```bash
//! daq-stream run --duration 10s --csv capture.csv
//! ```
//!
//! Validate a configuration:
//! ```bash
//! daq-stream check --config config/daq_stream.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_stream::config::{StreamConfig, DEFAULT_CONFIG_PATH};
use daq_stream::controller::AcquisitionController;
use daq_stream::hardware::mock::{MockScanDevice, Pacing};
use daq_stream::logging::{self, OutputFormat, TracingConfig};
use daq_stream::signal::StopSignal;
use daq_stream::sink::{ConsoleSink, FanoutSink};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-stream")]
#[command(about = "Continuous double-buffered analog input streaming", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json), overriding the configuration
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    /// Log span open/close events
    #[arg(long, global = true)]
    log_spans: bool,

    /// Disable ANSI colors in pretty output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from the simulated device
    Run {
        /// Stop automatically after this long (e.g. "10s", "2m")
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Write every delivered half to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Scans of each half to print (0 disables the console preview)
        #[arg(long)]
        preview: Option<usize>,

        /// Fill every transfer immediately instead of pacing at the scan rate
        #[arg(long)]
        instant: bool,
    },

    /// Validate configuration and print the buffer geometry
    Check,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = StreamConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init(tracing_config(&cli, &config)?).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            duration,
            csv,
            preview,
            instant,
        } => run(config, duration, csv, preview, instant),
        Commands::Check => check(&config),
    }
}

fn tracing_config(cli: &Cli, config: &StreamConfig) -> Result<TracingConfig> {
    let mut tracing = TracingConfig::from_stream_config(config)
        .map_err(anyhow::Error::msg)?
        .with_span_events(cli.log_spans)
        .with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        tracing = tracing.with_format(format);
    }
    Ok(tracing)
}

fn check(config: &StreamConfig) -> Result<()> {
    config.validate().context("configuration is invalid")?;

    let scan = &config.scan;
    println!("Configuration OK");
    println!(
        "  channels      {}..={} ({} channels, {})",
        scan.low_channel,
        scan.high_channel,
        scan.channel_count(),
        scan.voltage_range
    );
    println!("  rate          {} Hz per channel", scan.rate);
    println!("  half buffer   {} scans / {} samples", scan.samples_per_half, scan.half_len());
    println!("  capacity      {} samples", scan.capacity());
    println!(
        "  half period   {:.1} ms",
        scan.samples_per_half as f64 * 1000.0 / f64::from(scan.rate)
    );
    Ok(())
}

fn run(
    mut config: StreamConfig,
    duration: Option<Duration>,
    csv: Option<PathBuf>,
    preview: Option<usize>,
    instant: bool,
) -> Result<()> {
    if let Some(path) = csv {
        config.output.csv_path = Some(path);
    }
    if let Some(preview) = preview {
        config.output.console_preview = preview;
    }

    let mut sink = FanoutSink::new();
    if config.output.console_preview > 0 {
        sink.push(Box::new(ConsoleSink::stdout(config.output.console_preview)));
    }
    #[cfg(feature = "storage_csv")]
    {
        if let Some(path) = &config.output.csv_path {
            let csv_sink = daq_stream::sink::CsvSink::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            sink.push(Box::new(csv_sink));
        }
    }
    #[cfg(not(feature = "storage_csv"))]
    {
        if config.output.csv_path.is_some() {
            warn!("CSV output requested but the storage_csv feature is disabled");
        }
    }

    let pacing = if instant {
        Pacing::Instant
    } else {
        Pacing::Realtime
    };
    let device = MockScanDevice::new().with_pacing(pacing);

    let stop = StopSignal::new();
    install_stop_triggers(&stop, duration)?;

    let controller = AcquisitionController::new(config);
    let mut session = controller
        .start_session(device)
        .context("starting acquisition session")?;

    println!("Streaming... press Enter (or Ctrl+C) to stop");
    let outcome = session.run(&mut sink, &stop);

    let summary = controller.stop_session(session);
    if let Some(e) = &summary.scan_stop_error {
        warn!(error = %e, "Device did not acknowledge the stop command");
    }
    println!(
        "Acquired {} samples in {:.2?} ({:.0} samples/s), {} halves delivered, {} overruns",
        summary.producer.units_transferred,
        summary.elapsed,
        summary.units_per_second(),
        summary.consumer.halves_delivered(),
        summary.consumer.overrun_events
    );

    outcome.context("acquisition stopped with an error")
}

/// Trigger `stop` on Enter, Ctrl+C, or after `duration`.
fn install_stop_triggers(stop: &StopSignal, duration: Option<Duration>) -> Result<()> {
    let on_signal = stop.clone();
    ctrlc::set_handler(move || on_signal.trigger()).context("installing Ctrl+C handler")?;

    let on_enter = stop.clone();
    thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => {} // stdin closed, rely on the other triggers
                Ok(_) => {
                    info!("Enter pressed, stopping");
                    on_enter.trigger();
                }
                Err(e) => warn!(error = %e, "Could not read stdin"),
            }
        })?;

    if let Some(duration) = duration {
        let on_timer = stop.clone();
        thread::Builder::new()
            .name("duration-timer".to_string())
            .spawn(move || {
                thread::sleep(duration);
                info!(?duration, "Run duration reached, stopping");
                on_timer.trigger();
            })?;
    }
    Ok(())
}
