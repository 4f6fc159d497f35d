//! Firmware entry point: parse arguments, load configuration, bring up
//! logging, and hand off to the runtime loop.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, warn};

use arx_common::config::{ConfigError, ConfigLoader, FirmwareConfig};
use arx_firmware::runtime;

#[derive(Debug, Parser)]
#[command(name = "arx_firmware", about = "Motion-control firmware for the ARX six-axis arm")]
struct Args {
    /// Path to the firmware TOML configuration.
    #[arg(long, default_value = "config/arx.toml")]
    config: PathBuf,

    /// Override the serial device from the configuration.
    #[arg(long)]
    port: Option<String>,

    /// Override the step-engine tick rate [Hz].
    #[arg(long)]
    tick_hz: Option<u32>,
}

fn main() {
    let args = Args::parse();

    let mut config = match FirmwareConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound) => {
            eprintln!(
                "config {} not found, using defaults",
                args.config.display()
            );
            FirmwareConfig::default()
        }
        Err(e) => {
            eprintln!("FATAL: {e}");
            process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.serial.device = port;
    }
    if let Some(tick_hz) = args.tick_hz {
        config.tick_hz = tick_hz;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.log_level.as_filter())
            }),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        process::exit(1);
    }

    info!(
        device = %config.serial.device,
        baud = config.serial.baud,
        tick_hz = config.tick_hz,
        "arx firmware starting"
    );

    match runtime::run(&config) {
        Ok(()) => {
            // A host Restart lands here; the supervisor relaunches us.
            warn!("exiting for restart");
        }
        Err(e) => {
            error!("fatal: {e}");
            process::exit(1);
        }
    }
}
