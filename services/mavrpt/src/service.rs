//! Service entry point
//!
//! Brings both transports up, runs the relay until stopped and tears
//! everything down again.

use std::sync::Arc;
use tracing::{info, warn};

use common::{Lifecycle, PidFile};
use errors::{BridgeError, BridgeResult};

use crate::config::BridgeConfig;
use crate::relay::{RelayEngine, RelayStats};
use crate::transport::{NetworkTransport, SerialTransport, Transport};

/// Run the relay described by `config` until `lifecycle` requests a stop
///
/// Setup failures are returned before the loop starts and leave nothing open.
/// The PID file only exists while the loop runs.
pub async fn start(config: &BridgeConfig, lifecycle: Arc<Lifecycle>) -> BridgeResult<RelayStats> {
    config.validate()?;

    let line = config.line_config()?;
    let serial = SerialTransport::open(&line).map_err(|e| BridgeError::SerialSetup {
        device: line.device.clone(),
        reason: e.to_string(),
    })?;

    let peer = config.peer_config();
    let network = NetworkTransport::open(&peer)
        .await
        .map_err(|e| BridgeError::NetworkSetup {
            endpoint: peer.endpoint(),
            reason: e.to_string(),
        })?;

    let mut pid_file = PidFile::create_or_warn(&config.pid_file);

    info!(
        "Relaying {} @ {} baud <-> udp {} ({})",
        line.device,
        line.baud_rate,
        peer.endpoint(),
        peer.mode()
    );

    let mut engine = RelayEngine::new(serial, network, lifecycle, config.relay_options());
    let result = engine.run().await;

    let serial_stats = engine.serial().stats();
    let network_stats = engine.network().stats();
    engine.shutdown();
    if let Some(pid_file) = pid_file.as_mut() {
        pid_file.remove();
    }

    match result {
        Ok(stats) => {
            info!(
                "Relay stopped: serial rx {} bytes / tx {} bytes, udp rx {} bytes / tx {} bytes, {} chunks dropped",
                serial_stats.bytes_received,
                serial_stats.bytes_sent,
                network_stats.bytes_received,
                network_stats.bytes_sent,
                stats.dropped_chunks
            );
            if stats.serial_read_failures > 0 {
                warn!(
                    "{} serial read failures during this run",
                    stats.serial_read_failures
                );
            }
            Ok(stats)
        },
        Err(e) => Err(BridgeError::Scheduler(e.to_string())),
    }
}
