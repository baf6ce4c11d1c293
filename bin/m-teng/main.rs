mod config;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use m_teng::{
    AcquisitionRequest, Acquirer, Backend, CancelToken, Channel, Device, InstrumentDevice,
    Reading, Recording, SyntheticDevice,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::config::{load_config, save_config, AppConfig, BackendKind, CONFIG_FILE_NAME};

/// TENG current/voltage measurements
#[derive(Parser, Debug)]
#[command(name = "m-teng")]
#[command(about = "Measure triboelectric nanogenerator output", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the configured device backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a fixed number of readings, timed by the device
    Count {
        /// Number of readings (default: measurement.count)
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Seconds between readings (default: measurement.interval)
        #[arg(short, long)]
        interval: Option<f64>,

        /// Run the measurement this many times
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Seconds to wait between repetitions
        #[arg(long, default_value_t = 0.0)]
        repeat_delay: f64,
    },
    /// Take readings until Ctrl+C or `--max` readings
    Measure {
        /// Seconds between readings (default: measurement.interval)
        #[arg(short, long)]
        interval: Option<f64>,

        /// Stop after this many readings
        #[arg(short, long)]
        max: Option<usize>,
    },
    /// Write the default configuration to a file
    InitConfig {
        #[arg(value_name = "FILE", default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Command::InitConfig { path } = &args.command {
        initialize_logging(args.log_level.as_deref().unwrap_or("info"))?;
        save_config(&AppConfig::default(), path)?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.device.backend = backend;
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_ref());

    let token = setup_shutdown_handler()?;
    let acquirer = Acquirer::new()
        .with_cancel_token(token.clone())
        .beep_when_done(config.measurement.beep_when_done);
    let device = open_backend(&config)?;

    match args.command {
        Command::Count {
            count,
            interval,
            repeat,
            repeat_delay,
        } => {
            let request = AcquisitionRequest::bounded(
                count.unwrap_or(config.measurement.count),
                seconds(interval.unwrap_or(config.measurement.interval))?,
            )
            .with_poll_cadence(config.measurement.poll_cadence())
            .with_channels(config.measurement.channels);
            run_count(&acquirer, device, request, repeat, seconds(repeat_delay)?, &token)
        }
        Command::Measure { interval, max } => {
            let request = AcquisitionRequest::unbounded(seconds(
                interval.unwrap_or(config.measurement.interval),
            )?)
            .with_max_count(max)
            .with_channels(config.measurement.channels);
            run_measure(&acquirer, device, request)
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

fn seconds(value: f64) -> Result<Duration, Box<dyn std::error::Error>> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("invalid number of seconds: {value}").into())
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&PathBuf>) {
    info!("=== m-teng ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults and search path"),
    }
    match config.device.backend {
        BackendKind::Keithley => info!(
            "Backend: Keithley at {}:{}",
            config.device.host, config.device.port
        ),
        BackendKind::Arduino => info!("Backend: Arduino over Bluetooth LE"),
        BackendKind::Synthetic => info!("Backend: synthetic test curve"),
    }
    info!(
        "Interval: {} s, channels: {:?}",
        config.measurement.interval, config.measurement.channels
    );
}

/// Open the configured device
fn open_backend(config: &AppConfig) -> Result<Backend, Box<dyn std::error::Error>> {
    let backend = match config.device.backend {
        BackendKind::Keithley => Backend::Instrument(InstrumentDevice::connect(
            &config.device.host,
            config.device.port,
            config.device.connection(),
            config.device.beep_on_connect,
        )?),
        BackendKind::Synthetic => Backend::Synthetic(
            SyntheticDevice::new(config.synthetic.curve())
                .with_current_scale(config.synthetic.current_scale),
        ),
        BackendKind::Arduino => {
            return Err("this build has no Bluetooth stack, the Arduino backend \
                        needs a GattLink supplied by the embedding application"
                .into());
        }
    };
    info!("Opened {} device", backend.name());
    Ok(backend)
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<CancelToken, Box<dyn std::error::Error>> {
    let token = CancelToken::new();
    let handler_token = token.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping measurement...");
        handler_token.cancel();
    })?;

    Ok(token)
}

/// Run `repeat` batches on a worker thread, printing previews as they come
fn run_count(
    acquirer: &Acquirer,
    mut device: Backend,
    request: AcquisitionRequest,
    repeat: usize,
    repeat_delay: Duration,
    token: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let count = request.count.unwrap_or(0);

    for run in 1..=repeat {
        if token.is_cancelled() {
            break;
        }
        if repeat > 1 {
            info!("Measurement {run}/{repeat}");
        }

        let handle = acquirer.spawn_bounded(device, request.clone());
        for preview in handle.previews().iter() {
            print_progress(preview.index + 1, Some(count), &preview.reading);
        }
        println!();

        let (returned, result) = handle.join()?;
        device = returned;
        match result {
            Ok(recording) => report(&recording),
            Err(e) => {
                error!("✗ Measurement failed: {e}");
                return Err(e.into());
            }
        }

        if run < repeat && !repeat_delay.is_zero() {
            thread::sleep(repeat_delay);
        }
    }
    Ok(())
}

/// Read until cancelled, printing every reading
fn run_measure(
    acquirer: &Acquirer,
    mut device: Backend,
    request: AcquisitionRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let max = request.count;
    let mut printer = |index: usize, reading: &Reading| print_progress(index + 1, max, reading);

    let result = acquirer.run_timed(&mut device, &request, &mut printer);
    println!();
    match result {
        Ok(recording) => {
            report(&recording);
            Ok(())
        }
        Err(e) => {
            error!("✗ Measurement failed: {e}");
            Err(e.into())
        }
    }
}

fn print_progress(n: usize, count: Option<usize>, reading: &Reading) {
    let mut stdout = io::stdout().lock();
    let _ = match count {
        Some(count) => write!(stdout, "\r{n:>6}/{count} {reading}    "),
        None => write!(stdout, "\r{n:>6} {reading}    "),
    };
    let _ = stdout.flush();
}

fn report(recording: &Recording) {
    if recording.is_complete() {
        info!("✓ Measurement completed: {} samples", recording.len());
    } else {
        warn!("Measurement stopped by user: {} samples", recording.len());
    }
    for channel in [Channel::Current, Channel::Voltage] {
        if let Some((min, max)) = recording.range(channel) {
            info!(
                "{} range: {min:.6e} to {max:.6e} {}",
                channel.column_name(),
                channel.unit()
            );
        }
    }
    if let Some(last) = recording.samples.last() {
        info!("Duration: {:.3} s", last.timestamp);
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
