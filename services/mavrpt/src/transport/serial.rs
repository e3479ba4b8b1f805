//! Serial Transport Implementation
//!
//! Owns one tty descriptor configured as a byte-transparent 8N1 pipe.
//! The descriptor stays in blocking mode; the relay only reads after
//! [`Transport::readable`] confirmed pending input, so a read returns at
//! least one byte without stalling. Writes block until the line drained and
//! run through [`tokio::task::block_in_place`] on a multi-threaded runtime.

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info};

use super::poll_readable;
use super::traits::{Transport, TransportError, TransportStats};

/// Supported line speeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    /// Every rate the transport accepts
    pub const ALL: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn as_u32(&self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115_200,
        }
    }

    /// Matching termios speed constant
    pub fn to_termios(&self) -> termios::BaudRate {
        match self {
            BaudRate::B9600 => termios::BaudRate::B9600,
            BaudRate::B19200 => termios::BaudRate::B19200,
            BaudRate::B38400 => termios::BaudRate::B38400,
            BaudRate::B57600 => termios::BaudRate::B57600,
            BaudRate::B115200 => termios::BaudRate::B115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = TransportError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        BaudRate::ALL
            .into_iter()
            .find(|rate| rate.as_u32() == value)
            .ok_or(TransportError::UnsupportedBaudRate(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.as_u32()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Device path and line speed; immutable once the transport is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub device: String,
    pub baud_rate: BaudRate,
}

impl LineConfig {
    /// Validate `baud_rate` against the supported set
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Result<Self, TransportError> {
        Ok(Self {
            device: device.into(),
            baud_rate: BaudRate::try_from(baud_rate)?,
        })
    }
}

/// Serial transport over a raw tty
#[derive(Debug)]
pub struct SerialTransport {
    config: LineConfig,
    handle: Option<AsyncFd<File>>,
    /// Held for the duration of every read / write syscall on `handle`
    io_lock: Mutex<()>,
    stats: Mutex<TransportStats>,
}

impl SerialTransport {
    /// Open and configure the device described by `config`
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &LineConfig) -> Result<Self, TransportError> {
        let open_failed = |reason: String| TransportError::OpenFailed {
            device: config.device.clone(),
            reason,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(&config.device)
            .map_err(|e| open_failed(e.to_string()))?;

        restore_blocking(&file).map_err(|e| open_failed(e.to_string()))?;
        configure_line(&file, config.baud_rate)?;

        // Only read readiness is awaited; writes go through the blocking fd
        let handle = AsyncFd::with_interest(file, Interest::READABLE)
            .map_err(|e| open_failed(e.to_string()))?;

        info!(
            "Serial device {} opened at {} baud",
            config.device, config.baud_rate
        );

        Ok(Self {
            config: config.clone(),
            handle: Some(handle),
            io_lock: Mutex::new(()),
            stats: Mutex::new(TransportStats::new()),
        })
    }

    /// Validate the rate, then open; an unsupported rate never touches the device
    pub fn open_device(device: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let config = LineConfig::new(device, baud_rate)?;
        Self::open(&config)
    }

    pub fn device(&self) -> &str {
        &self.config.device
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.config.baud_rate
    }

    /// Current line attributes of the open device
    pub fn termios(&self) -> Result<Termios, TransportError> {
        let handle = self.handle()?;
        termios::tcgetattr(handle.get_ref().as_fd())
            .map_err(|e| TransportError::AttrGetFailed(e.to_string()))
    }

    fn handle(&self) -> Result<&AsyncFd<File>, TransportError> {
        self.handle.as_ref().ok_or(TransportError::ResourceClosed)
    }

    fn record(&self, result: &Result<usize, TransportError>, sent: bool) {
        let mut stats = self.stats.lock();
        match result {
            Ok(n) if sent => stats.record_sent(*n),
            Ok(n) => stats.record_received(*n),
            Err(e) => stats.record_error(e),
        }
    }
}

/// Run a blocking syscall without stalling the other tasks of the worker
///
/// `block_in_place` is only available on the multi-threaded scheduler; a
/// current-thread runtime (or no runtime) runs `f` inline.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        },
        _ => f(),
    }
}

/// Clear O_NONBLOCK after the open so reads block until data arrives
fn restore_blocking(file: &File) -> nix::Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(())
}

fn configure_line(file: &File, baud_rate: BaudRate) -> Result<(), TransportError> {
    let mut tty = termios::tcgetattr(file.as_fd())
        .map_err(|e| TransportError::AttrGetFailed(e.to_string()))?;

    termios::cfsetispeed(&mut tty, baud_rate.to_termios())
        .map_err(|e| TransportError::AttrSetFailed(e.to_string()))?;
    termios::cfsetospeed(&mut tty, baud_rate.to_termios())
        .map_err(|e| TransportError::AttrSetFailed(e.to_string()))?;
    apply_raw_mode(&mut tty);

    termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &tty)
        .map_err(|e| TransportError::AttrSetFailed(e.to_string()))
}

/// Raw 8N1 discipline: no flow control, no translation, no echo, VMIN=1 VTIME=0
pub fn apply_raw_mode(tty: &mut Termios) {
    tty.control_flags &= !(ControlFlags::PARENB
        | ControlFlags::CSTOPB
        | ControlFlags::CSIZE
        | ControlFlags::CRTSCTS);
    tty.control_flags |= ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;

    tty.input_flags &= !(InputFlags::IXON
        | InputFlags::IXOFF
        | InputFlags::IXANY
        | InputFlags::ICRNL
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INPCK
        | InputFlags::BRKINT);

    tty.output_flags &= !OutputFlags::OPOST;

    tty.local_flags &= !(LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHONL
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);

    tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

/// Whether `tty` carries the discipline set by [`apply_raw_mode`]
pub fn is_raw_8n1(tty: &Termios) -> bool {
    let cflag = tty.control_flags;
    (cflag & ControlFlags::CSIZE) == ControlFlags::CS8
        && cflag.contains(ControlFlags::CLOCAL | ControlFlags::CREAD)
        && !cflag.intersects(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CRTSCTS)
        && !tty.input_flags.intersects(
            InputFlags::IXON
                | InputFlags::IXOFF
                | InputFlags::IXANY
                | InputFlags::ICRNL
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::PARMRK,
        )
        && !tty.output_flags.contains(OutputFlags::OPOST)
        && !tty.local_flags.intersects(
            LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ISIG,
        )
        && tty.control_chars[SpecialCharacterIndices::VMIN as usize] == 1
        && tty.control_chars[SpecialCharacterIndices::VTIME as usize] == 0
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    async fn readable(&self) -> Result<(), TransportError> {
        let handle = self.handle()?;
        loop {
            let mut guard = handle.readable().await?;
            if poll_readable(handle.get_ref().as_fd())? {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let handle = self.handle()?;
        let result = {
            let _io = self.io_lock.lock();
            let mut file = handle.get_ref();
            file.read(buf).map_err(TransportError::from)
        };
        self.record(&result, false);
        result
    }

    fn write_chunk(&self, data: &[u8]) -> Result<usize, TransportError> {
        let handle = self.handle()?;
        let result = run_blocking(|| {
            let _io = self.io_lock.lock();
            let mut file = handle.get_ref();
            file.write_all(data)
                .map_err(TransportError::from)
                .and_then(|()| {
                    // Bytes are on the wire before the lock is released
                    termios::tcdrain(file.as_fd())
                        .map_err(|e| TransportError::Io(format!("drain failed: {}", e)))
                })
                .map(|()| data.len())
        });
        self.record(&result, true);
        result
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("Serial device {} closed", self.config.device);
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_supported_baud_rates() {
        for raw in [9600, 19200, 38400, 57600, 115_200] {
            let rate = BaudRate::try_from(raw).unwrap();
            assert_eq!(rate.as_u32(), raw);
            assert_eq!(rate.to_string(), raw.to_string());
        }
    }

    #[test]
    fn test_unsupported_baud_rates() {
        for raw in [0, 300, 4800, 57601, 230_400] {
            assert_eq!(
                BaudRate::try_from(raw),
                Err(TransportError::UnsupportedBaudRate(raw))
            );
        }
    }

    #[test]
    fn test_unsupported_rate_fails_before_open() {
        // A path that would fail to open if it were ever touched
        let err = SerialTransport::open_device("/dev/mavrpt-does-not-exist", 4800).unwrap_err();
        assert_eq!(err, TransportError::UnsupportedBaudRate(4800));
    }

    #[tokio::test]
    async fn test_missing_device_is_open_failure() {
        let err = SerialTransport::open_device("/dev/mavrpt-does-not-exist", 57600).unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { .. }));
        assert!(err.is_setup_error());
    }

    #[test]
    fn test_baud_rate_serde() {
        let config: LineConfig =
            serde_json::from_str(r#"{"device":"/dev/ttyACM0","baud_rate":115200}"#).unwrap();
        assert_eq!(config.baud_rate, BaudRate::B115200);

        let bad = serde_json::from_str::<LineConfig>(r#"{"device":"/dev/ttyACM0","baud_rate":4800}"#);
        assert!(bad.is_err());
    }
}
