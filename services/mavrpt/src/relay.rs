//! Relay Engine
//!
//! Single control loop that waits for readiness on both transports with a
//! bounded timeout and forwards each drained chunk verbatim to the other side.
//!
//! Per iteration:
//! 1. wait until either transport is readable, the timeout expires, or a
//!    stop / reconfigure request arrives
//! 2. serial -> network: one read, one send
//! 3. network -> serial: one receive, one write
//!
//! Forwarding failures drop the chunk and the loop carries on. A serial read
//! that fails or hits end-of-file takes the serial side out of the readiness
//! wait for one wait timeout, so a vanished device cannot spin the loop. Only a
//! broken readiness wait ends the loop with an error.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use common::Lifecycle;

use crate::transport::{Transport, TransportError};

/// Minimum size of the chunk buffer
pub const MIN_BUFFER_SIZE: usize = 1024;
/// Default bound of one readiness wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The readiness wait failed for a reason other than a stop / reconfigure request
    #[error("Readiness wait failed on {transport}: {source}")]
    Scheduler {
        transport: String,
        source: TransportError,
    },

    #[error("Relay already stopped")]
    AlreadyStopped,
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayState {
    Running,
    /// Stop requested; no further readiness waits
    Draining,
    /// Transports closed
    Stopped,
}

/// Counters accumulated by the relay loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub iterations: u64,
    pub timeouts: u64,
    pub serial_to_network_chunks: u64,
    pub serial_to_network_bytes: u64,
    pub network_to_serial_chunks: u64,
    pub network_to_serial_bytes: u64,
    /// Chunks lost because the forwarding write / send failed
    pub dropped_chunks: u64,
    /// Failed serial reads, including end-of-file on a hung-up device
    pub serial_read_failures: u64,
    pub network_receive_failures: u64,
    pub reconfigure_requests: u64,
}

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub wait_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            buffer_size: MIN_BUFFER_SIZE,
        }
    }
}

enum WaitOutcome {
    Interrupted,
    TimedOut,
    Ready,
    Failed(RelayError),
}

/// Bidirectional relay between a serial-side and a network-side transport
///
/// Both transports are owned exclusively by the engine; all reads and writes
/// happen on the task running [`RelayEngine::run`].
#[derive(Debug)]
pub struct RelayEngine<S: Transport, N: Transport> {
    serial: S,
    network: N,
    lifecycle: Arc<Lifecycle>,
    wait_timeout: Duration,
    buffer: Vec<u8>,
    state: RelayState,
    stats: RelayStats,
    /// Serial side is left out of readiness waits until then
    serial_paused_until: Option<Instant>,
}

impl<S: Transport, N: Transport> RelayEngine<S, N> {
    pub fn new(serial: S, network: N, lifecycle: Arc<Lifecycle>, options: RelayOptions) -> Self {
        let buffer_size = options.buffer_size.max(MIN_BUFFER_SIZE);
        Self {
            serial,
            network,
            lifecycle,
            wait_timeout: options.wait_timeout,
            buffer: vec![0u8; buffer_size],
            state: RelayState::Running,
            stats: RelayStats::default(),
            serial_paused_until: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn serial(&self) -> &S {
        &self.serial
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Relay until stop is requested or the readiness wait fails
    ///
    /// Leaves the engine in `Draining`; call [`RelayEngine::shutdown`] to
    /// release the transports.
    pub async fn run(&mut self) -> Result<RelayStats, RelayError> {
        if self.state != RelayState::Running {
            return Err(RelayError::AlreadyStopped);
        }

        info!(
            "Relay started: {} <-> {}",
            self.serial.transport_type(),
            self.network.transport_type()
        );

        while self.state == RelayState::Running {
            if self.lifecycle.stop_requested() {
                self.state = RelayState::Draining;
                break;
            }

            self.stats.iterations += 1;
            if self
                .serial_paused_until
                .is_some_and(|until| Instant::now() >= until)
            {
                self.serial_paused_until = None;
                debug!("Serial side back in the readiness wait");
            }

            match self.wait_ready().await {
                WaitOutcome::Interrupted => {
                    if self.lifecycle.stop_requested() {
                        info!("Stop requested, draining relay");
                        self.state = RelayState::Draining;
                    } else if self.lifecycle.take_reconfigure() {
                        self.stats.reconfigure_requests += 1;
                        info!("Reconfigure requested, nothing to reload");
                    }
                    continue;
                },
                WaitOutcome::TimedOut => {
                    self.stats.timeouts += 1;
                    continue;
                },
                WaitOutcome::Failed(e) => {
                    error!("Relay stopped: {}", e);
                    self.state = RelayState::Draining;
                    return Err(e);
                },
                WaitOutcome::Ready => {},
            }

            // Snapshot readiness of both sides before forwarding anything
            let serial_ready = if self.serial_paused_until.is_some() {
                false
            } else {
                match probe(&self.serial) {
                    Ok(ready) => ready,
                    Err(e) => return Err(self.fail(e)),
                }
            };
            let network_ready = match probe(&self.network) {
                Ok(ready) => ready,
                Err(e) => return Err(self.fail(e)),
            };

            if serial_ready {
                self.forward_serial_to_network();
            }
            if network_ready {
                self.forward_network_to_serial();
            }
        }

        info!(
            "Relay loop finished: {} chunks serial->network, {} chunks network->serial, {} dropped",
            self.stats.serial_to_network_chunks,
            self.stats.network_to_serial_chunks,
            self.stats.dropped_chunks
        );

        Ok(self.stats.clone())
    }

    /// Close both transports; safe to call more than once
    pub fn shutdown(&mut self) {
        if self.state == RelayState::Stopped {
            return;
        }
        self.serial.close();
        self.network.close();
        self.state = RelayState::Stopped;
        debug!("Relay transports closed");
    }

    async fn wait_ready(&self) -> WaitOutcome {
        let serial = &self.serial;
        let network = &self.network;
        let paused_until = self.serial_paused_until;

        let either_readable = async {
            if paused_until.is_some() {
                return network
                    .readable()
                    .await
                    .map_err(|e| scheduler_error(network, e));
            }
            tokio::select! {
                r = serial.readable() => r.map_err(|e| scheduler_error(serial, e)),
                r = network.readable() => r.map_err(|e| scheduler_error(network, e)),
            }
        };
        let wait = match paused_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => self.wait_timeout,
        };

        tokio::select! {
            biased;
            _ = self.lifecycle.interrupted() => WaitOutcome::Interrupted,
            result = tokio::time::timeout(wait, either_readable) => match result {
                Err(_) => WaitOutcome::TimedOut,
                Ok(Ok(())) => WaitOutcome::Ready,
                Ok(Err(e)) => WaitOutcome::Failed(e),
            },
        }
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        error!("Relay stopped: {}", err);
        self.state = RelayState::Draining;
        err
    }

    fn forward_serial_to_network(&mut self) {
        let n = match self.serial.read_chunk(&mut self.buffer) {
            Ok(0) => {
                // Readable with nothing to read: the line hung up
                self.stats.serial_read_failures += 1;
                error!("Serial device hung up, device may be gone");
                self.pause_serial();
                return;
            },
            Ok(n) => n,
            Err(TransportError::WouldBlock) => return,
            Err(e) => {
                self.stats.serial_read_failures += 1;
                error!("Serial read failed, device may be gone: {}", e);
                self.pause_serial();
                return;
            },
        };

        match self.network.write_chunk(&self.buffer[..n]) {
            Ok(_) => {
                self.stats.serial_to_network_chunks += 1;
                self.stats.serial_to_network_bytes += n as u64;
                trace!("Forwarded {} bytes serial -> network", n);
            },
            Err(e) => {
                self.stats.dropped_chunks += 1;
                warn!("Dropped {} bytes serial -> network: {}", n, e);
            },
        }
    }

    fn pause_serial(&mut self) {
        self.serial_paused_until = Some(Instant::now() + self.wait_timeout);
    }

    fn forward_network_to_serial(&mut self) {
        let n = match self.network.read_chunk(&mut self.buffer) {
            Ok(0) => return,
            Ok(n) => n,
            Err(TransportError::WouldBlock) => return,
            Err(e) => {
                self.stats.network_receive_failures += 1;
                warn!("Network receive failed: {}", e);
                return;
            },
        };

        match self.serial.write_chunk(&self.buffer[..n]) {
            Ok(_) => {
                self.stats.network_to_serial_chunks += 1;
                self.stats.network_to_serial_bytes += n as u64;
                trace!("Forwarded {} bytes network -> serial", n);
            },
            Err(e) => {
                self.stats.dropped_chunks += 1;
                warn!("Dropped {} bytes network -> serial: {}", n, e);
            },
        }
    }
}

/// Non-blocking readiness check used after the wait resolved
fn probe<T: Transport>(transport: &T) -> Result<bool, RelayError> {
    match transport.readable().now_or_never() {
        Some(Ok(())) => Ok(true),
        Some(Err(e)) => Err(scheduler_error(transport, e)),
        None => Ok(false),
    }
}

fn scheduler_error<T: Transport>(transport: &T, source: TransportError) -> RelayError {
    RelayError::Scheduler {
        transport: transport.transport_type().to_string(),
        source,
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use tracing::Instrument;
    use tracing_test::traced_test;

    const LIMIT: Duration = Duration::from_secs(2);

    struct Harness {
        serial: MockTransport,
        network: MockTransport,
        lifecycle: Arc<Lifecycle>,
        engine: tokio::task::JoinHandle<(Result<RelayStats, RelayError>, RelayState)>,
    }

    fn start(wait_timeout: Duration) -> Harness {
        let serial = MockTransport::new("serial");
        let network = MockTransport::new("udp");
        let lifecycle = Arc::new(Lifecycle::new());

        let mut engine = RelayEngine::new(
            serial.clone(),
            network.clone(),
            Arc::clone(&lifecycle),
            RelayOptions {
                wait_timeout,
                buffer_size: 0,
            },
        );
        let engine = tokio::spawn(
            async move {
                let result = engine.run().await;
                engine.shutdown();
                (result, engine.state())
            }
            .in_current_span(),
        );

        Harness {
            serial,
            network,
            lifecycle,
            engine,
        }
    }

    impl Harness {
        async fn stop(self) -> (Result<RelayStats, RelayError>, RelayState) {
            self.lifecycle.request_stop();
            tokio::time::timeout(LIMIT, self.engine)
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_forwards_both_directions_verbatim() {
        let h = start(DEFAULT_WAIT_TIMEOUT);

        let telemetry: Vec<u8> = (0..37).collect();
        h.serial.push_inbound(&telemetry);
        assert!(h.network.wait_for_writes(1, LIMIT).await);

        let command = [0xFEu8, 0x09, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x08];
        h.network.push_inbound(&command);
        assert!(h.serial.wait_for_writes(1, LIMIT).await);

        assert_eq!(h.network.written(), vec![telemetry]);
        assert_eq!(h.serial.written(), vec![command.to_vec()]);

        let (result, state) = h.stop().await;
        let stats = result.unwrap();
        assert_eq!(state, RelayState::Stopped);
        assert_eq!(stats.serial_to_network_bytes, 37);
        assert_eq!(stats.network_to_serial_bytes, 12);
        assert_eq!(stats.dropped_chunks, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_chunk_is_forwarded_in_one_piece() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        let chunk: Vec<u8> = (0..MIN_BUFFER_SIZE).map(|i| (i % 251) as u8).collect();
        h.serial.push_inbound(&chunk);
        assert!(h.network.wait_for_writes(1, LIMIT).await);
        assert_eq!(h.network.written(), vec![chunk]);
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_are_not_coalesced() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        h.serial.push_inbound(b"first");
        h.serial.push_inbound(b"second");
        assert!(h.network.wait_for_writes(2, LIMIT).await);
        assert_eq!(
            h.network.written(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_forward_failure_drops_chunk_and_continues() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        h.network
            .fail_next_write(TransportError::Io("Connection refused".into()));

        h.serial.push_inbound(b"lost");
        h.serial.push_inbound(b"kept");
        assert!(h.network.wait_for_writes(1, LIMIT).await);
        assert_eq!(h.network.written(), vec![b"kept".to_vec()]);

        let stats = h.stop().await.0.unwrap();
        assert_eq!(stats.dropped_chunks, 1);
        assert!(logs_contain("Dropped 4 bytes serial -> network"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_serial_read_failure_is_reported_distinctly() {
        let h = start(Duration::from_millis(100));
        h.serial
            .push_read_error(TransportError::Io("Input/output error".into()));
        h.serial.push_inbound(b"after");
        assert!(h.network.wait_for_writes(1, LIMIT).await);

        let stats = h.stop().await.0.unwrap();
        assert_eq!(stats.serial_read_failures, 1);
        assert!(logs_contain("Serial read failed, device may be gone"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn test_hung_up_serial_backs_off_for_one_timeout() {
        let h = start(Duration::from_millis(50));
        h.serial.hang_up();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Network traffic still flows while the serial side is paused
        h.network.push_inbound(b"uplink");
        assert!(h.serial.wait_for_writes(1, LIMIT).await);

        let started = std::time::Instant::now();
        let (result, state) = h.stop().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(state, RelayState::Stopped);

        let stats = result.unwrap();
        // One failed read per 50 ms pause, not one per loop iteration
        assert!(stats.serial_read_failures >= 2, "{:?}", stats);
        assert!(stats.serial_read_failures <= 12, "{:?}", stats);
        assert!(stats.iterations <= 40, "{:?}", stats);
        assert_eq!(stats.network_to_serial_bytes, 6);
        assert!(logs_contain("Serial device hung up, device may be gone"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn test_would_block_is_silent() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        // Readiness without data: every receive reports WouldBlock
        h.network.set_always_ready(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (result, _) = h.stop().await;
        let stats = result.unwrap();
        assert!(stats.iterations > 1);
        assert_eq!(stats.network_receive_failures, 0);
        assert!(!logs_contain("Network receive failed"));
        assert!(!logs_contain("Relay stopped"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_looping() {
        let h = start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = h.stop().await.0.unwrap();
        assert!(stats.timeouts >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_under_load_within_one_timeout() {
        let h = start(Duration::from_millis(200));
        h.serial.set_always_ready(true);
        h.network.set_always_ready(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        h.lifecycle.request_stop();
        let (result, state) = tokio::time::timeout(LIMIT, h.engine)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, RelayState::Stopped);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let h = start(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        let (result, _) = h.stop().await;
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reconfigure_is_counted_and_loop_continues() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        h.lifecycle.request_reconfigure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.serial.push_inbound(b"still relaying");
        assert!(h.network.wait_for_writes(1, LIMIT).await);

        let stats = h.stop().await.0.unwrap();
        assert_eq!(stats.reconfigure_requests, 1);
        assert!(logs_contain("Reconfigure requested"));
    }

    #[tokio::test]
    async fn test_readiness_failure_is_fatal() {
        let h = start(DEFAULT_WAIT_TIMEOUT);
        h.network
            .fail_readiness(TransportError::Io("Bad file descriptor".into()));

        let (result, state) = tokio::time::timeout(LIMIT, h.engine)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(RelayError::Scheduler { ref transport, .. }) if transport == "udp"
        ));
        assert_eq!(state, RelayState::Stopped);
        assert_eq!(h.serial.close_calls(), 1);
        assert_eq!(h.network.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_run_refuses_afterwards() {
        let serial = MockTransport::new("serial");
        let network = MockTransport::new("udp");
        let mut engine = RelayEngine::new(
            serial.clone(),
            network.clone(),
            Arc::new(Lifecycle::new()),
            RelayOptions::default(),
        );

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.state(), RelayState::Stopped);
        assert_eq!(serial.close_calls(), 1);
        assert!(network.is_closed());
        assert_eq!(engine.run().await, Err(RelayError::AlreadyStopped));
    }
}
