//! MAVLink Repeater Library (mavrpt)
//!
//! Relays a byte-oriented serial telemetry link to a UDP endpoint and back,
//! forwarding every chunk verbatim. The carried protocol is never parsed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ Serial Transport│◄──►│  Relay Engine   │◄──►│ UDP Transport   │
//! │ (raw 8N1 tty)   │    │ (readiness loop)│    │ (client/server) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 ▲
//!                                 │ stop / reconfigure
//!                        ┌─────────────────┐
//!                        │    Lifecycle    │◄── SIGINT / SIGTERM / SIGHUP
//!                        └─────────────────┘
//! ```
//!
//! - **`config`**: layered configuration (defaults, JSON profile, env, CLI)
//! - **`bootstrap`**: command line, logging setup and daemonization
//! - **`transport`**: serial and UDP transports behind one trait
//! - **`relay`**: the forwarding loop
//! - **`service`**: `start` entry point tying it together

pub mod bootstrap;
pub mod config;
pub mod relay;
pub mod service;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, ProgramFunction};
pub use relay::{RelayEngine, RelayError, RelayOptions, RelayState, RelayStats};
pub use service::start;
