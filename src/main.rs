//! CLI Entry Point for board-daq
//!
//! Runs single measurements against the bench instruments and prints the
//! outcome as a JSON `MeasurementReport` on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! Capture a waveform from the configured scope:
//! ```bash
//! board-daq scope --channel 2
//! ```
//!
//! Read the multimeter:
//! ```bash
//! board-daq meter dc-voltage --host 192.168.0.201
//! ```
//!
//! Try everything against an in-process mock instrument:
//! ```bash
//! board-daq demo --chunk-size 16
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use board_daq::config::{BenchConfig, InstrumentConfig, DEFAULT_CONFIG_PATH};
use board_daq::logging::{self, OutputFormat, TracingConfig};
use board_daq::mock::{MockBehavior, MockInstrument, ReplyScript, ScopeReply};
use board_daq::scpi::{scope_capture_sequence, MeterFunction, ScopeChannel, WAVEFORM_COMMAND_COUNT};
use board_daq::session::{configure, measure_reading, measure_waveform};
use board_daq::MeasurementReport;

#[derive(Parser)]
#[command(name = "board-daq")]
#[command(about = "Capture readings from networked bench instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one waveform from the oscilloscope
    Scope {
        #[command(flatten)]
        target: Target,

        /// Analog channel (1-4)
        #[arg(long)]
        channel: Option<u8>,
    },

    /// Query one multimeter reading
    Meter {
        /// Measurement function, e.g. dc-voltage
        function: MeterFunction,

        #[command(flatten)]
        target: Target,
    },

    /// Switch the multimeter to a measurement function
    Configure {
        /// Measurement function, e.g. resistance
        function: MeterFunction,

        #[command(flatten)]
        target: Target,
    },

    /// Capture from an in-process mock oscilloscope
    Demo {
        /// Split the mock reply into chunks of this many bytes
        #[arg(long, default_value = "64")]
        chunk_size: usize,

        /// Delay between chunks in milliseconds
        #[arg(long, default_value = "5")]
        delay_ms: u64,
    },

    /// Write the effective configuration as TOML
    InitConfig {
        /// Destination file (stdout when omitted)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Endpoint overrides shared by the instrument commands.
#[derive(Args)]
struct Target {
    /// Instrument host
    #[arg(long)]
    host: Option<String>,

    /// Instrument TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Target {
    fn apply(&self, base: &InstrumentConfig) -> InstrumentConfig {
        InstrumentConfig {
            host: self.host.clone().unwrap_or_else(|| base.host.clone()),
            port: self.port.unwrap_or(base.port),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Err(msg) = config.validate() {
        bail!("Invalid configuration: {}", msg);
    }

    let level = match &cli.log_level {
        Some(level) => logging::parse_log_level(level),
        None => logging::parse_log_level(&config.application.log_level),
    }
    .map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::new(level).with_format(cli.log_format))
        .map_err(anyhow::Error::msg)?;

    let report = match cli.command {
        Commands::Scope { target, channel } => run_scope(&config, &target, channel).await?,
        Commands::Meter { function, target } => {
            let meter = target.apply(&config.multimeter);
            let result = measure_reading(&meter.endpoint(), &function.measure_query()).await;
            MeasurementReport::from_reading(&result)
        }
        Commands::Configure { function, target } => {
            let meter = target.apply(&config.multimeter);
            let result = configure(&meter.endpoint(), &function.configure_command()).await;
            MeasurementReport::from_configure(&result)
        }
        Commands::Demo {
            chunk_size,
            delay_ms,
        } => run_demo(chunk_size, delay_ms).await?,
        Commands::InitConfig { path, force } => {
            write_config(&config, path, force)?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_scope(
    config: &BenchConfig,
    target: &Target,
    channel: Option<u8>,
) -> Result<MeasurementReport> {
    let scope = target.apply(&config.oscilloscope.instrument);
    let number = channel.unwrap_or(config.oscilloscope.channel);
    let Some(channel) = ScopeChannel::new(number) else {
        bail!("Invalid channel {}: must be 1-4", number);
    };

    let commands = scope_capture_sequence(channel);
    let result = measure_waveform(&scope.endpoint(), &commands).await;
    Ok(MeasurementReport::from_waveform(&result))
}

async fn run_demo(chunk_size: usize, delay_ms: u64) -> Result<MeasurementReport> {
    let reply = ScopeReply {
        trailing_newline: true,
        ..ScopeReply::default()
    };
    let script = ReplyScript::new(reply.to_bytes())
        .after_lines(WAVEFORM_COMMAND_COUNT)
        .chunked(chunk_size)
        .with_delay(Duration::from_millis(delay_ms));

    let mock = MockInstrument::start(MockBehavior::Reply(script))
        .await
        .context("Failed to start mock oscilloscope")?;
    tracing::info!("Mock oscilloscope at {}", mock.addr());

    let commands = scope_capture_sequence(ScopeChannel::default());
    let result = measure_waveform(&mock.endpoint(2_000), &commands).await;
    Ok(MeasurementReport::from_waveform(&result))
}

fn write_config(config: &BenchConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let text = config.to_toml()?;
    match path {
        None => print!("{text}"),
        Some(path) => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote configuration to {}", path.display());
        }
    }
    Ok(())
}
