//! Transport Layer Traits
//!
//! Core trait and types shared by the serial and network transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device could not be opened
    #[error("Failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    /// Baud rate outside the supported set
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Reading the line attributes failed
    #[error("Failed to read line attributes: {0}")]
    AttrGetFailed(String),

    /// Applying the line attributes failed
    #[error("Failed to apply line attributes: {0}")]
    AttrSetFailed(String),

    /// Datagram socket could not be created or associated with its peer
    #[error("Socket creation failed: {0}")]
    SocketCreateFailed(String),

    /// Datagram socket could not be bound to the listen port
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// No data currently available; not a failure
    #[error("Operation would block")]
    WouldBlock,

    /// Fewer bytes left than were handed in
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Handle used after close
    #[error("Resource closed")]
    ResourceClosed,

    /// Send without a fixed peer
    #[error("Not connected: {0}")]
    NotConnected(String),
}

impl TransportError {
    /// Errors that can only happen while bringing a transport up
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            TransportError::OpenFailed { .. }
                | TransportError::UnsupportedBaudRate(_)
                | TransportError::AttrGetFailed(_)
                | TransportError::AttrSetFailed(_)
                | TransportError::SocketCreateFailed(_)
                | TransportError::BindFailed(_)
        )
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::WouldBlock)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            TransportError::WouldBlock
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total bytes written / sent
    pub bytes_sent: u64,
    /// Total bytes read / received
    pub bytes_received: u64,
    /// Number of successful writes / sends
    pub chunks_sent: u64,
    /// Number of reads / receives that produced data
    pub chunks_received: u64,
    /// Number of failed IO operations (would-block excluded)
    pub errors: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful write / send
    pub fn record_sent(&mut self, bytes: usize) {
        self.chunks_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record one read / receive; empty reads are not counted
    pub fn record_received(&mut self, bytes: usize) {
        if bytes > 0 {
            self.chunks_received += 1;
            self.bytes_received += bytes as u64;
        }
    }

    /// Record a failed operation
    pub fn record_error(&mut self, err: &TransportError) {
        if !err.is_would_block() {
            self.errors += 1;
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Core transport trait used by the relay engine
///
/// Reads and writes are synchronous calls made only after [`Transport::readable`]
/// reported data, so they never stall the opposite direction.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Get transport type identifier
    fn transport_type(&self) -> &str;

    /// Wait until a read would return without blocking
    ///
    /// Level-triggered: resolves again as long as data is pending. Errors here
    /// mean the readiness wait itself is broken.
    async fn readable(&self) -> Result<(), TransportError>;

    /// Read one chunk into `buf`
    ///
    /// `Ok(0)` means end of stream; [`TransportError::WouldBlock`] means
    /// nothing is available right now.
    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write `data` as one unit; anything short of the full chunk is an error
    fn write_chunk(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Release the underlying resource; safe to call more than once
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Snapshot of the transport counters
    fn stats(&self) -> TransportStats;
}
