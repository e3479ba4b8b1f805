//! Network (UDP) Transport Implementation
//!
//! Client mode connects the socket to one fixed peer; server mode binds all
//! local interfaces and accepts datagrams from any source without tracking
//! who sent them.

use async_trait::async_trait;
use nix::sys::socket::MsgFlags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd};
use std::str::FromStr;
use tokio::io::Interest;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info};

use super::poll_readable;
use super::traits::{Transport, TransportError, TransportStats};

/// Peer mode of the datagram socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Fixed remote peer
    Client,
    /// Bound listen port, any source
    Server,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Client => write!(f, "client"),
            NetworkMode::Server => write!(f, "server"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client" => Ok(NetworkMode::Client),
            "server" => Ok(NetworkMode::Server),
            other => Err(format!(
                "Invalid network mode '{}'. Valid values: client, server",
                other
            )),
        }
    }
}

/// Where the datagram socket points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConfig {
    Client {
        remote_address: String,
        remote_port: u16,
    },
    Server {
        listen_port: u16,
    },
}

impl PeerConfig {
    pub fn mode(&self) -> NetworkMode {
        match self {
            PeerConfig::Client { .. } => NetworkMode::Client,
            PeerConfig::Server { .. } => NetworkMode::Server,
        }
    }

    /// Human-readable endpoint for logs and errors
    pub fn endpoint(&self) -> String {
        match self {
            PeerConfig::Client {
                remote_address,
                remote_port,
            } => format!("{}:{}", remote_address, remote_port),
            PeerConfig::Server { listen_port } => format!("0.0.0.0:{}", listen_port),
        }
    }
}

/// UDP transport
#[derive(Debug)]
pub struct NetworkTransport {
    mode: NetworkMode,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    /// Held for the duration of every send / receive syscall on `socket`
    io_lock: Mutex<()>,
    stats: Mutex<TransportStats>,
}

impl NetworkTransport {
    /// Open the socket described by `peer`
    pub async fn open(peer: &PeerConfig) -> Result<Self, TransportError> {
        match peer {
            PeerConfig::Client {
                remote_address,
                remote_port,
            } => Self::open_client(remote_address, *remote_port).await,
            PeerConfig::Server { listen_port } => Self::open_server(*listen_port).await,
        }
    }

    /// Datagram socket associated with `remote_address:port`
    pub async fn open_client(remote_address: &str, port: u16) -> Result<Self, TransportError> {
        let create_failed = |reason: String| {
            TransportError::SocketCreateFailed(format!("{}:{}: {}", remote_address, port, reason))
        };

        let target = lookup_host((remote_address, port))
            .await
            .map_err(|e| create_failed(e.to_string()))?
            .next()
            .ok_or_else(|| create_failed("address did not resolve".to_string()))?;

        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| create_failed(e.to_string()))?;
        socket
            .connect(target)
            .await
            .map_err(|e| create_failed(e.to_string()))?;

        info!("UDP client socket connected to {}", target);

        Ok(Self::from_socket(NetworkMode::Client, socket, Some(target)))
    }

    /// Datagram socket bound to `listen_port` on all interfaces
    pub async fn open_server(listen_port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, listen_port))
            .await
            .map_err(|e| TransportError::BindFailed(format!("0.0.0.0:{}: {}", listen_port, e)))?;

        info!("UDP server socket listening on 0.0.0.0:{}", listen_port);

        Ok(Self::from_socket(NetworkMode::Server, socket, None))
    }

    fn from_socket(mode: NetworkMode, socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            mode,
            socket: Some(socket),
            peer,
            io_lock: Mutex::new(()),
            stats: Mutex::new(TransportStats::new()),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    /// Fixed peer in client mode
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket()?.local_addr()?)
    }

    /// Send one datagram to the fixed peer
    pub fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let result = self.socket().and_then(|socket| {
            if self.mode == NetworkMode::Server {
                return Err(TransportError::NotConnected(
                    "server mode has no fixed peer".to_string(),
                ));
            }
            // Straight to send(2): tokio's cached write readiness may not be
            // populated yet right after the socket was created
            let sent = {
                let _io = self.io_lock.lock();
                nix::sys::socket::send(socket.as_raw_fd(), data, MsgFlags::MSG_DONTWAIT)
                    .map_err(io::Error::from)?
            };
            if sent == data.len() {
                Ok(sent)
            } else {
                Err(TransportError::ShortWrite {
                    written: sent,
                    expected: data.len(),
                })
            }
        });

        let mut stats = self.stats.lock();
        match &result {
            Ok(n) => stats.record_sent(*n),
            Err(e) => stats.record_error(e),
        }
        result
    }

    /// Receive one datagram without blocking
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let result = self.socket().and_then(|socket| {
            let _io = self.io_lock.lock();
            Ok(socket.try_recv(buf)?)
        });

        let mut stats = self.stats.lock();
        match &result {
            Ok(n) => stats.record_received(*n),
            Err(e) => stats.record_error(e),
        }
        result
    }

    fn socket(&self) -> Result<&UdpSocket, TransportError> {
        self.socket.as_ref().ok_or(TransportError::ResourceClosed)
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn transport_type(&self) -> &str {
        "udp"
    }

    async fn readable(&self) -> Result<(), TransportError> {
        let socket = self.socket()?;
        loop {
            socket.readable().await?;
            if poll_readable(socket.as_fd())? {
                return Ok(());
            }
            // Stale readiness: clear it so the next wait parks
            let _ = socket.try_io(Interest::READABLE, || {
                Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
            });
        }
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.receive(buf)
    }

    fn write_chunk(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.send(data)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP {} socket closed", self.mode);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}
