//! Relay configuration
//!
//! Resolution order, lowest to highest precedence:
//! 1. built-in defaults for the program function
//! 2. the JSON file's section for the program function (`mavrpt`,
//!    `mavrptclient` or `mavrptserver`)
//! 3. `MAVRPT_*` environment variables, `__` separating nested keys
//!    (e.g. `MAVRPT_SERIAL__DEVICE=/dev/ttyUSB0`)
//! 4. command-line overrides (applied by the bootstrap)
//!
//! ```json
//! {
//!   "mavrptclient": {
//!     "serial":  { "device": "/dev/ttyACM0", "baud_rate": 57600 },
//!     "network": { "mode": "client", "remote_address": "10.100.1.102", "remote_port": 14550 },
//!     "logging": { "file": "/var/log/mavrpt.log", "max_size": 524288, "level": "info" },
//!     "daemon": true
//!   }
//! }
//! ```

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use common::logging::{LogLevel, DEFAULT_LOG_FILE_SIZE, DEFAULT_LOG_LEVEL};
use common::pidfile::DEFAULT_PID_FILE;
use errors::BridgeError;

use crate::relay::{RelayOptions, MIN_BUFFER_SIZE};
use crate::transport::{BaudRate, LineConfig, NetworkMode, PeerConfig};

/// Default JSON configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/mavlink-repeater.json";
/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "MAVRPT_";

pub const DEFAULT_SERIAL_DEVICE: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD_RATE: u32 = 57600;
pub const DEFAULT_REMOTE_ADDRESS: &str = "10.100.1.102";
pub const DEFAULT_PORT: u16 = 14550;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1000;
/// Pause between daemonizing and opening the devices
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 10;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { field, reason } => BridgeError::InvalidConfig { field, reason },
            other => BridgeError::Configuration(other.to_string()),
        }
    }
}

// ============================================================================
// Program function
// ============================================================================

/// Role selected by the name the binary was invoked under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramFunction {
    /// `mavrpt`: air station straight to the ground station
    Repeater,
    /// `mavrptclient`: air station into the IP tunnel
    Client,
    /// `mavrptserver`: tunnel endpoint towards the ground station software
    Server,
}

impl ProgramFunction {
    /// Derive the function from `argv[0]`; unknown names act as the repeater
    pub fn from_program_name(argv0: &str) -> Self {
        let name = Path::new(argv0)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(argv0);
        match name {
            "mavrptserver" => ProgramFunction::Server,
            "mavrptclient" => ProgramFunction::Client,
            _ => ProgramFunction::Repeater,
        }
    }

    /// Section of the JSON file holding this function's settings
    pub fn profile(&self) -> &'static str {
        match self {
            ProgramFunction::Repeater => "mavrpt",
            ProgramFunction::Client => "mavrptclient",
            ProgramFunction::Server => "mavrptserver",
        }
    }

    pub fn default_mode(&self) -> NetworkMode {
        match self {
            ProgramFunction::Server => NetworkMode::Server,
            ProgramFunction::Repeater | ProgramFunction::Client => NetworkMode::Client,
        }
    }
}

// ============================================================================
// Configuration sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    /// Validated against the supported set before the device is opened
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_SERIAL_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    /// Client mode: peer host or address
    pub remote_address: String,
    /// Client mode: peer port
    pub remote_port: u16,
    /// Server mode: local port bound on all interfaces
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Client,
            remote_address: DEFAULT_REMOTE_ADDRESS.to_string(),
            remote_port: DEFAULT_PORT,
            listen_port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log file; console when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Rotation threshold in bytes
    pub max_size: u64,
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_size: DEFAULT_LOG_FILE_SIZE,
            level: DEFAULT_LOG_LEVEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bound of one readiness wait
    pub wait_timeout_ms: u64,
    /// Chunk buffer size, at least 1024
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            buffer_size: MIN_BUFFER_SIZE,
        }
    }
}

/// Fully resolved relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub pid_file: PathBuf,
    /// Detach from the terminal before starting
    pub daemon: bool,
    /// Pause after daemonizing, before the devices are opened
    pub startup_delay_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::defaults_for(ProgramFunction::Repeater)
    }
}

impl BridgeConfig {
    /// Built-in defaults for `function`
    pub fn defaults_for(function: ProgramFunction) -> Self {
        Self {
            serial: SerialConfig::default(),
            network: NetworkConfig {
                mode: function.default_mode(),
                ..NetworkConfig::default()
            },
            logging: LoggingConfig::default(),
            relay: RelayConfig::default(),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            daemon: false,
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
        }
    }

    /// Layered provider chain for `function` reading `config_file`
    pub fn figment(function: ProgramFunction, config_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::defaults_for(function)))
            .merge(Json::file(config_file).nested())
            .merge(Env::prefixed(ENV_PREFIX).split("__").global())
            .select(function.profile())
    }

    /// Resolve the configuration
    ///
    /// Without an explicit `config_file` the default file is optional; an
    /// explicit file must exist.
    pub fn load(function: ProgramFunction, config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match config_file {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => path,
            None => Path::new(DEFAULT_CONFIG_FILE),
        };

        Self::figment(function, path)
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Check the resolved values; runs before any device is opened
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.device.trim().is_empty() {
            return Err(ConfigError::invalid("serial.device", "must not be empty"));
        }
        BaudRate::try_from(self.serial.baud_rate).map_err(|_| {
            ConfigError::invalid(
                "serial.baud_rate",
                format!(
                    "{} is not supported (9600, 19200, 38400, 57600, 115200)",
                    self.serial.baud_rate
                ),
            )
        })?;

        match self.network.mode {
            NetworkMode::Client => {
                if self.network.remote_address.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        "network.remote_address",
                        "required in client mode",
                    ));
                }
                if self.network.remote_port == 0 {
                    return Err(ConfigError::invalid("network.remote_port", "must not be 0"));
                }
            },
            NetworkMode::Server => {
                if self.network.listen_port == 0 {
                    return Err(ConfigError::invalid("network.listen_port", "must not be 0"));
                }
            },
        }

        if self.logging.max_size == 0 {
            return Err(ConfigError::invalid("logging.max_size", "must be greater than 0"));
        }
        if self.relay.wait_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "relay.wait_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.relay.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::invalid(
                "relay.buffer_size",
                format!("must be at least {}", MIN_BUFFER_SIZE),
            ));
        }

        Ok(())
    }

    pub fn line_config(&self) -> Result<LineConfig, ConfigError> {
        LineConfig::new(&self.serial.device, self.serial.baud_rate)
            .map_err(|e| ConfigError::invalid("serial.baud_rate", e.to_string()))
    }

    pub fn peer_config(&self) -> PeerConfig {
        match self.network.mode {
            NetworkMode::Client => PeerConfig::Client {
                remote_address: self.network.remote_address.clone(),
                remote_port: self.network.remote_port,
            },
            NetworkMode::Server => PeerConfig::Server {
                listen_port: self.network.listen_port,
            },
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            wait_timeout: Duration::from_millis(self.relay.wait_timeout_ms),
            buffer_size: self.relay.buffer_size,
        }
    }
}
