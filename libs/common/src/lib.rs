//! Common library for the mavrpt relay
//!
//! Ambient services shared by the relay binary and its tests:
//! - `logging`: the process log sink (level filter, file/console destination,
//!   size rotation) and its `tracing` bridge
//! - `lifecycle`: stop / reconfigure requests and the signal watcher
//! - `pidfile`: PID-file bookkeeping

pub mod lifecycle;
pub mod logging;
pub mod pidfile;

pub use lifecycle::{spawn_signal_watcher, Lifecycle};
pub use logging::{init_tracing, LogLevel, LogSink, SinkLayer};
pub use pidfile::PidFile;
