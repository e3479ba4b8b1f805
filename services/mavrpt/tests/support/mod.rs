//! Shared helpers for the mavrpt integration tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pseudo-terminal standing in for a serial device
///
/// The relay opens `device()`; the test drives the other end.
pub struct FakeSerial {
    master: Arc<File>,
    device: String,
}

impl FakeSerial {
    pub fn new() -> Self {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let device = ptsname_r(&master).unwrap();
        // SAFETY: the descriptor is taken over from `master`, which is consumed
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        Self {
            master: Arc::new(master),
            device,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Close the controlling side, as when a USB adapter is unplugged
    pub fn hang_up(self) {
        drop(self);
    }

    /// Bytes as the autopilot would send them
    pub fn write(&self, data: &[u8]) {
        let mut master = &*self.master;
        master.write_all(data).unwrap();
        master.flush().unwrap();
    }

    /// Collect up to `want` bytes the relay wrote to the device
    pub async fn read(&self, want: usize, limit: Duration) -> Vec<u8> {
        let master = Arc::clone(&self.master);
        tokio::task::spawn_blocking(move || read_blocking(&master, want, limit))
            .await
            .unwrap()
    }
}

fn read_blocking(master: &File, want: usize, limit: Duration) -> Vec<u8> {
    let deadline = Instant::now() + limit;
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    while out.len() < want && Instant::now() < deadline {
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(20u16)).unwrap_or(0);
        if ready == 0 {
            continue;
        }
        let mut reader = master;
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    out
}

/// Poll `check` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
