//! CLI Entry Point for forceplate_daq
//!
//! Provides command-line interface for:
//! - Streaming a platform to stdout as JSON lines
//! - Printing a platform's diagnostics report
//! - Showing the resolved node options
//!
//! Logs go to stderr so stdout stays machine-readable.
//!
//! # Usage
//!
//! Stream ten seconds from the simulated platform, zeroing after two:
//! ```bash
//! forceplate stream --simulate --duration 10 --zero-at 2
//! ```
//!
//! Print the report of the attached AMTI amplifier:
//! ```bash
//! forceplate diagnostics --config config/forceplate.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forceplate_daq::config::{NodeOptions, DEFAULT_OPTIONS_FILE};
use forceplate_daq::device::DeviceHandle;
use forceplate_daq::hardware::{OpenRequest, PlatformDriver, SimulatedPlatform};
use forceplate_daq::logging;
use forceplate_daq::node::{NodeEvent, StreamingNode};
use forceplate_daq::store::ConfigStore;
use forceplate_daq::TaggedSample;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "forceplate")]
#[command(about = "Force platform acquisition driver", long_about = None)]
struct Cli {
    /// Options file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_OPTIONS_FILE)]
    config: PathBuf,

    /// Use the simulated platform instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream samples to stdout as JSON lines until Ctrl+C
    Stream {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Request a zero this many seconds after streaming starts
        #[arg(long)]
        zero_at: Option<f64>,

        /// Also print node events to stdout
        #[arg(long)]
        events: bool,
    },

    /// Open the platform, print its report as JSON and close it
    Diagnostics,

    /// Print the resolved options as TOML
    Options,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = NodeOptions::load_from(&cli.config)
        .with_context(|| format!("loading options from {}", cli.config.display()))?;
    logging::init_from_options(&options).map_err(anyhow::Error::msg)?;
    options.validate()?;

    match cli.command {
        Commands::Stream {
            duration,
            zero_at,
            events,
        } => stream(options, cli.simulate, duration, zero_at, events).await,
        Commands::Diagnostics => diagnostics(options, cli.simulate).await,
        Commands::Options => {
            print!("{}", toml::to_string_pretty(&options)?);
            Ok(())
        }
    }
}

fn driver(simulate: bool) -> Result<Arc<dyn PlatformDriver>> {
    if simulate {
        return Ok(Arc::new(SimulatedPlatform::new()));
    }

    #[cfg(feature = "amti_hardware")]
    {
        Ok(Arc::new(forceplate_daq::hardware::AmtiDriver::new()))
    }

    #[cfg(not(feature = "amti_hardware"))]
    {
        anyhow::bail!(
            "built without the 'amti_hardware' feature; pass --simulate or rebuild with --features amti_hardware"
        )
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{} value {}", flag, value))
}

fn record_line(record: &TaggedSample) -> serde_json::Value {
    serde_json::json!({
        "tick": record.tick,
        "wall_clock": record.wall_clock,
        "gap": record.gap,
        "gap_reason": record.gap_reason,
        "timestamp": record.sample.as_ref().map(|s| s.timestamp),
        "readings": record.sample.as_ref().map(|s| &s.readings),
        "counter": record.sample.as_ref().and_then(|s| s.counter),
    })
}

async fn stream(
    options: NodeOptions,
    simulate: bool,
    duration: Option<f64>,
    zero_at: Option<f64>,
    print_events: bool,
) -> Result<()> {
    let store = ConfigStore::from_options(&options);
    let node = Arc::new(StreamingNode::new(options, driver(simulate)?, store));
    let mut events = node.events();
    let mut samples = node.start().await?;

    if let Some(layout) = samples.recv().await.map(|first| {
        println!("{}", record_line(&first));
        Arc::clone(&first.layout)
    }) {
        eprintln!("{}", serde_json::to_string(layout.as_ref())?);
    }

    let stop_after = duration.map(|d| seconds(d, "duration")).transpose()?;
    let zero_after = zero_at.map(|z| seconds(z, "zero-at")).transpose()?;

    if let Some(delay) = zero_after {
        let trigger = node.zero_trigger();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(outcome = ?trigger.request("cli"), "Zero requested");
        });
    }

    let deadline = async {
        match stop_after {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            record = samples.recv() => match record {
                Some(record) => println!("{}", record_line(&record)),
                None => {
                    warn!("Sample stream ended");
                    break;
                }
            },
            event = events.recv(), if print_events => {
                if let Ok(event) = event {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(samples);
    let summary = node.stop().await?;
    let stopped = NodeEvent::Stopped(summary);
    eprintln!("{}", serde_json::to_string_pretty(&stopped)?);
    Ok(())
}

async fn diagnostics(options: NodeOptions, simulate: bool) -> Result<()> {
    let driver = driver(simulate)?;
    let mut request = OpenRequest::new(options.sample_rate).with_index(options.device_index);
    if let Some(serial) = &options.device_serial {
        request = request.with_serial(serial.clone());
    }

    let mut handle = DeviceHandle::open(driver.as_ref(), &request, options.read_timeout).await?;
    let report = handle.report().await;
    handle.close();

    println!("{}", serde_json::to_string_pretty(&report?)?);
    Ok(())
}
