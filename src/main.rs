//! # expctl
//!
//! Command-line front end for field and current sweeps, single traces,
//! thermometry and sample rotation.
//!
//! ```bash
//! # Field sweep with the configured defaults, on simulated instruments
//! expctl --simulate sweep
//!
//! # Current sweep, 0 to 10 mA in 0.5 mA steps, hard limit 200 mA
//! expctl sweep --variable current --low 0 --high 0.01 --step 0.0005 --limit 0.2
//!
//! # One trace with a saved background subtracted
//! expctl trace --start 7.49e9 --stop 7.494e9 --background bg.csv --output run.csv
//!
//! # Temperature every 5 s, 100 samples
//! expctl temp-log --interval 5 --samples 100
//! ```
//!
//! Ctrl-C stops the running operation at its next step boundary.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exp_control::config::{Settings, DEFAULT_CONFIG_FILE};
use exp_control::core::SweepVariable;
use exp_control::data::TemperatureLogWriter;
use exp_control::experiment::{ExperimentSession, SweepConfig};
use exp_control::instrument::RotationDirection;
use exp_control::measurement::{SParameter, TraceConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// expctl - sweep-and-acquire instrument control
#[derive(Parser)]
#[command(name = "expctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML); EXPCTL_* environment variables override it
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Run against simulated instruments instead of VISA hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step the field or current and acquire a trace at every set-point
    Sweep {
        /// Swept quantity (field or current)
        #[arg(long, value_parser = parse_arg::<SweepVariable>)]
        variable: Option<SweepVariable>,

        /// First set-point
        #[arg(long, allow_negative_numbers = true)]
        low: Option<f64>,

        /// Upper bound, excluded unless equal to --low
        #[arg(long, allow_negative_numbers = true)]
        high: Option<f64>,

        /// Set-point increment
        #[arg(long)]
        step: Option<f64>,

        /// Hard limit; the sweep aborts before applying anything above it
        #[arg(long, allow_negative_numbers = true)]
        limit: Option<f64>,

        /// Fixed wait after each set-point, seconds
        #[arg(long)]
        settle_secs: Option<f64>,

        /// Do not write record files
        #[arg(long)]
        no_save: bool,

        #[command(flatten)]
        trace: TraceArgs,
    },

    /// Acquire a single trace
    Trace {
        #[command(flatten)]
        trace: TraceArgs,

        /// Trace file whose magnitude is subtracted
        #[arg(long, value_name = "FILE")]
        background: Option<PathBuf>,

        /// Save the trace to this file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Read the sample temperature once
    Temperature,

    /// Log the sample temperature at a fixed interval
    TempLog {
        /// Seconds between samples (at least 2)
        #[arg(long, default_value_t = 2.0)]
        interval: f64,

        /// Number of samples
        #[arg(long)]
        samples: usize,

        /// Log file (defaults to a timestamped file in the output directory)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Turn the rotation stage
    Rotate {
        /// Motor steps (about 50 per 4.5 degrees)
        #[arg(long)]
        steps: u32,

        /// left (anticlockwise) or right (clockwise), viewed from above
        #[arg(long, value_parser = parse_arg::<RotationDirection>)]
        direction: RotationDirection,
    },
}

/// Per-run overrides of the `[trace]` settings.
#[derive(Args)]
struct TraceArgs {
    /// Start frequency, Hz
    #[arg(long)]
    start: Option<f64>,

    /// Stop frequency, Hz
    #[arg(long)]
    stop: Option<f64>,

    /// Number of points
    #[arg(long)]
    points: Option<usize>,

    /// IF bandwidth, Hz
    #[arg(long)]
    bandwidth: Option<f64>,

    /// Number of averaged sweeps
    #[arg(long)]
    averages: Option<u32>,

    /// Source power, dBm
    #[arg(long, allow_negative_numbers = true)]
    power: Option<f64>,

    /// Measured S-parameter
    #[arg(long, value_parser = parse_arg::<SParameter>)]
    parameter: Option<SParameter>,
}

/// Parse with the library's `FromStr`, reporting errors as plain text.
fn parse_arg<T>(value: &str) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| e.to_string())
}

impl TraceArgs {
    fn apply(&self, base: &TraceConfig) -> TraceConfig {
        let mut config = base.clone();
        if let Some(start) = self.start {
            config.start_freq = start;
        }
        if let Some(stop) = self.stop {
            config.stop_freq = stop;
        }
        if let Some(points) = self.points {
            config.num_points = points;
        }
        if let Some(bandwidth) = self.bandwidth {
            config.bandwidth_hz = bandwidth;
        }
        if let Some(averages) = self.averages {
            config.averages = averages;
        }
        if let Some(power) = self.power {
            config.power_dbm = Some(power);
        }
        if let Some(parameter) = self.parameter {
            config.selected_parameter = parameter;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: failed to load settings from {}: {}", cli.config.display(), err);
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match run(cli, settings).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<ExitCode> {
    let mut session = if cli.simulate {
        info!("using simulated instruments");
        ExperimentSession::simulated(settings)?
    } else {
        ExperimentSession::connect(settings)
            .await
            .context("failed to connect to instruments")?
    };

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next step boundary");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Sweep {
            variable,
            low,
            high,
            step,
            limit,
            settle_secs,
            no_save,
            trace,
        } => {
            let defaults = &session.settings().sweep;
            let sweep = SweepConfig {
                variable: variable.unwrap_or(defaults.variable),
                low: low.unwrap_or(defaults.low),
                high: high.unwrap_or(defaults.high),
                step: step.unwrap_or(defaults.step),
                hard_limit: limit.unwrap_or(defaults.hard_limit),
                settle_time_seconds: settle_secs.unwrap_or(defaults.settle_time_seconds),
            };
            let trace = trace.apply(&session.settings().trace);

            let outcome = session.run_sweep(&sweep, &trace, !no_save).await?;
            let count = outcome.persisted.max(outcome.records.len());
            match outcome.failure() {
                None => {
                    println!("Sweep complete: {} set-points measured.", count);
                    Ok(ExitCode::SUCCESS)
                }
                Some(failure) => {
                    eprintln!(
                        "Sweep terminated at {} = {} {} ({}): {}",
                        sweep.variable,
                        failure.setpoint,
                        sweep.variable.unit(),
                        failure.error.kind(),
                        failure.error
                    );
                    eprintln!("{} set-points completed before termination.", count);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Trace {
            trace,
            background,
            output,
        } => {
            let config = trace.apply(&session.settings().trace);
            let result = session
                .acquire_trace(&config, background.as_deref(), output.as_deref())
                .await?;
            println!("Trace acquired: {} points.", result.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Temperature => {
            let sample = session.measure_temperature().await?;
            println!(
                "T = {:.4} K (R = {:.3} Ω)",
                sample.temperature_k, sample.resistance_ohm
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::TempLog {
            interval,
            samples,
            output,
        } => {
            let every = Duration::try_from_secs_f64(interval)
                .with_context(|| format!("invalid interval {}", interval))?;
            let storage = &session.settings().storage;
            let path = output.or_else(|| {
                storage.enabled.then(|| {
                    storage.output_dir.join(format!(
                        "temperature_{}.csv",
                        chrono::Utc::now().format("%Y%m%d_%H%M%S")
                    ))
                })
            });
            let mut log = path.map(TemperatureLogWriter::create).transpose()?;

            let taken = session
                .log_temperature(every, samples, log.as_mut())
                .await?;
            println!("{} temperature samples taken.", taken.len());
            if let Some(log) = &log {
                println!("Log written to {}.", log.path().display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Rotate { steps, direction } => {
            let global = session.rotate(steps, direction).await?;
            println!("Rotated {} steps {}; global step count {}.", steps, direction, global);
            Ok(ExitCode::SUCCESS)
        }
    }
}
