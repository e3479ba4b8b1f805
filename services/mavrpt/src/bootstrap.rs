//! Service Bootstrap and Initialization
//!
//! This module handles process setup before the relay starts:
//! - Command-line arguments and their overrides on the resolved configuration
//! - Log sink configuration
//! - Daemonization

use clap::Parser;
use nix::unistd::{fork, setsid, ForkResult};
use std::path::PathBuf;
use tracing::{debug, info};

use common::logging::{LogLevel, LogSink, DEFAULT_LOG_FILE};
use errors::{BridgeError, BridgeResult, EXIT_OK};

use crate::config::{BridgeConfig, LoggingConfig};
use crate::transport::NetworkMode;

/// Command-line arguments for mavrpt
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "mavrpt",
    version = env!("CARGO_PKG_VERSION"),
    about = "Serial <-> UDP telemetry relay",
    long_about = None
)]
pub struct Args {
    /// JSON configuration file (default: /etc/mavlink-repeater.json, optional)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Serial device
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Serial baud rate (9600, 19200, 38400, 57600, 115200)
    #[arg(short = 'b', long = "baudrate")]
    pub baud_rate: Option<u32>,

    /// Network mode (client, server)
    #[arg(short = 'm', long)]
    pub mode: Option<NetworkMode>,

    /// Remote address in client mode
    #[arg(short = 'r', long)]
    pub remote: Option<String>,

    /// Remote port in client mode
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Listen port in server mode
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Log to a file instead of the console (default path: /tmp/mavrpt.log)
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    pub logfile: Option<PathBuf>,

    /// Log file rotation threshold in bytes
    #[arg(long)]
    pub logfilesize: Option<u64>,

    /// Log level (trace, debug, info, warn, error, none)
    #[arg(short = 'l', long = "loglevel")]
    pub log_level: Option<LogLevel>,

    /// Run as daemon
    #[arg(short = 'D', long)]
    pub daemon: bool,

    /// PID file location
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Validation mode - print the resolved configuration and exit
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Apply command-line values on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(device) = &self.device {
            config.serial.device = device.clone();
        }
        if let Some(baud_rate) = self.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
        if let Some(mode) = self.mode {
            config.network.mode = mode;
        }
        if let Some(remote) = &self.remote {
            config.network.remote_address = remote.clone();
        }
        if let Some(port) = self.port {
            config.network.remote_port = port;
        }
        if let Some(listen_port) = self.listen_port {
            config.network.listen_port = listen_port;
        }
        if let Some(logfile) = &self.logfile {
            config.logging.file = Some(logfile.clone());
        }
        if let Some(size) = self.logfilesize {
            config.logging.max_size = size;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.daemon {
            config.daemon = true;
        }
        if let Some(pid_file) = &self.pid_file {
            config.pid_file = pid_file.clone();
        }
    }
}

/// Point the sink at the configured destination and threshold
///
/// An unusable log file leaves the sink on the console; the sink reports that
/// itself.
pub fn configure_logging(sink: &LogSink, logging: &LoggingConfig) {
    sink.set_level(logging.level);
    match &logging.file {
        Some(path) => {
            if sink.set_file_destination(path, logging.max_size).is_ok() {
                debug!(
                    "Logging to {} (rotation at {} bytes)",
                    path.display(),
                    logging.max_size
                );
            }
        },
        None => sink.set_console_destination(),
    }
}

/// Render the resolved configuration for `--validate`
pub fn render_config(config: &BridgeConfig) -> BridgeResult<String> {
    serde_json::to_string_pretty(config)
        .map_err(|e| BridgeError::Configuration(format!("cannot render configuration: {}", e)))
}

/// Detach from the controlling terminal
///
/// The parent exits immediately with status 0; the child becomes a session
/// leader. Must run before the tokio runtime or any other thread is started.
pub fn daemonize() -> BridgeResult<()> {
    // SAFETY: called while the process is still single-threaded
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("Daemon child started with pid {}", child);
            std::process::exit(EXIT_OK);
        },
        Ok(ForkResult::Child) => {},
        Err(e) => return Err(BridgeError::Daemonize(format!("fork failed: {}", e))),
    }

    setsid().map_err(|e| BridgeError::Daemonize(format!("setsid failed: {}", e)))?;
    info!("Running as daemon");
    Ok(())
}
