//! Transport Layer Module
//!
//! The two endpoints the relay moves bytes between:
//!
//! ```text
//!  autopilot ──serial──▶ ┌────────────────┐ ──udp──▶ ground station
//!                        │  Relay Engine  │
//!  autopilot ◀─serial─── └────────────────┘ ◀─udp─── ground station
//! ```
//!
//! - **Serial** - raw 8N1 tty, blocking reads gated by readiness
//! - **Udp** - connected (client) or bound (server) datagram socket
//! - **Mock** - controllable mock transport for testing

pub mod serial;
pub mod traits;
pub mod udp;

#[cfg(test)]
pub mod mock;

pub use serial::{BaudRate, LineConfig, SerialTransport};
pub use traits::{Transport, TransportError, TransportStats};
pub use udp::{NetworkMode, NetworkTransport, PeerConfig};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::BorrowedFd;

/// Non-blocking level check on a descriptor
///
/// Hang-up and error conditions count as readable so the following read
/// surfaces them.
pub(crate) fn poll_readable(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0].revents().is_some_and(|revents| {
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
        })),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}
