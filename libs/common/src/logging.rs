//! Process log sink for the mavrpt relay
//!
//! A single [`LogSink`] owns the process-wide level threshold and the active
//! destination (a size-rotated file or the console). Components never write to
//! the sink directly; they use the `tracing` macros and [`SinkLayer`] forwards
//! every enabled event to [`LogSink::emit`].
//!
//! File records look like `[2025-12-02 00:50:44] WARN : Serial read failed`,
//! console records like `mavrpt [WARN]: Serial read failed`.

use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::subscriber::Interest;
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::Layer;

/// Default log file used when file logging is requested without a path
pub const DEFAULT_LOG_FILE: &str = "/tmp/mavrpt.log";
/// Default rotation threshold for a configured log file: 512 KiB
pub const DEFAULT_LOG_FILE_SIZE: u64 = 512 * 1024;
/// Rotation threshold used when a destination is opened without one: 1 MiB
pub const DEFAULT_LOG_FILE_SIZE_MAX: u64 = 1024 * 1024;
/// Threshold a fresh sink starts with
pub const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Warn;

// ============================================================================
// LogLevel
// ============================================================================

/// Ordered severity of a record, most verbose first
///
/// `None` is only meaningful as a threshold (it suppresses everything); it is
/// never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    #[serde(alias = "warning")]
    Warn = 3,
    Error = 4,
    #[serde(alias = "off")]
    None = 5,
}

impl LogLevel {
    /// Upper-case label written into records
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `pad` keeps width/alignment flags working for the file format
        f.pad(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(format!(
                "Invalid log level '{}'. Valid values: trace, debug, info, warn, error, none",
                other
            )),
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

// ============================================================================
// Destinations
// ============================================================================

/// Rotating file destination
struct FileTarget {
    path: PathBuf,
    max_size: u64,
    file: File,
}

impl FileTarget {
    fn open(path: &Path, max_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            file,
        })
    }

    /// Archive the active file once it has reached the threshold
    ///
    /// Returns true when a rotation happened. Failures leave the sink writing
    /// to whichever handle is still usable.
    fn rotate_if_needed(&mut self) -> bool {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                // Deleted underneath us: start a fresh file at the same path
                if let Ok(file) = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                {
                    self.file = file;
                }
                return false;
            },
        };

        if size < self.max_size {
            return false;
        }

        let archive = archive_path(&self.path);
        if fs::rename(&self.path, &archive).is_err() {
            return false;
        }

        // On reopen failure the old handle (now pointing at the archive) stays
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(file) => {
                self.file = file;
                true
            },
            Err(_) => false,
        }
    }
}

/// Name of the single archived generation for `path`
///
/// `.old` is inserted before the extension: `/var/log/mavrpt.log` becomes
/// `/var/log/mavrpt.old.log`, `/var/log/mavrpt` becomes `/var/log/mavrpt.old`.
pub fn archive_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_stem()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".old");
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

struct SinkInner {
    console: Box<dyn Write + Send>,
    file: Option<FileTarget>,
    rotations: u64,
}

// ============================================================================
// LogSink
// ============================================================================

/// Process-wide log sink
///
/// Shared as `Arc<LogSink>`. The threshold is an atomic so the level check in
/// [`LogSink::emit`] happens before any lock or I/O.
pub struct LogSink {
    tag: String,
    level: AtomicU8,
    inner: Mutex<SinkInner>,
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("tag", &self.tag)
            .field("level", &self.level())
            .field("file", &self.file_path())
            .finish()
    }
}

impl LogSink {
    /// Create a console sink writing to stderr at the default threshold
    pub fn new(tag: impl Into<String>) -> Self {
        Self::with_console_writer(tag, Box::new(io::stderr()))
    }

    /// Create a console sink writing to `console`
    pub fn with_console_writer(tag: impl Into<String>, console: Box<dyn Write + Send>) -> Self {
        Self {
            tag: tag.into(),
            level: AtomicU8::new(DEFAULT_LOG_LEVEL as u8),
            inner: Mutex::new(SinkInner {
                console,
                file: None,
                rotations: 0,
            }),
        }
    }

    /// Process tag used in console records
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Set the minimum emitted level; applies from the next `emit`
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Whether a record at `level` would be written
    #[inline]
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && level >= self.level()
    }

    /// Route records to `path`, rotating once it reaches `max_size` bytes
    ///
    /// A `max_size` of zero selects [`DEFAULT_LOG_FILE_SIZE_MAX`]. When the
    /// file cannot be opened the sink falls back to the console, reports the
    /// fallback there and returns the open error.
    pub fn set_file_destination(&self, path: impl AsRef<Path>, max_size: u64) -> io::Result<()> {
        let path = path.as_ref();
        let max_size = if max_size == 0 {
            DEFAULT_LOG_FILE_SIZE_MAX
        } else {
            max_size
        };

        match FileTarget::open(path, max_size) {
            Ok(target) => {
                self.inner.lock().file = Some(target);
                Ok(())
            },
            Err(e) => {
                self.inner.lock().file = None;
                self.emit(
                    LogLevel::Error,
                    &format!(
                        "Cannot open log file {}: {}, logging to console",
                        path.display(),
                        e
                    ),
                );
                Err(e)
            },
        }
    }

    /// Route records to the console
    pub fn set_console_destination(&self) {
        self.inner.lock().file = None;
    }

    /// Active log file, if any
    pub fn file_path(&self) -> Option<PathBuf> {
        self.inner.lock().file.as_ref().map(|t| t.path.clone())
    }

    /// Number of rotations performed since the sink was created
    pub fn rotations(&self) -> u64 {
        self.inner.lock().rotations
    }

    /// Write one record
    ///
    /// Records below the threshold return after the comparison. File records
    /// are written in one call and flushed before returning.
    pub fn emit(&self, level: LogLevel, message: &str) {
        if !self.is_enabled(level) {
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(target) = inner.file.as_mut() {
            if target.rotate_if_needed() {
                inner.rotations += 1;
            }
            let line = format!(
                "[{}] {:<5}: {}\n",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                level,
                message
            );
            // Logging must never take the process down
            let _ = target.file.write_all(line.as_bytes());
            let _ = target.file.flush();
            return;
        }

        let line = format!("{} [{}]: {}\n", self.tag, level, message);
        let _ = inner.console.write_all(line.as_bytes());
        let _ = inner.console.flush();
    }

    /// Close the file destination; later records go to the console
    pub fn close(&self) {
        if let Some(mut target) = self.inner.lock().file.take() {
            let _ = target.file.flush();
        }
    }
}

// ============================================================================
// tracing bridge
// ============================================================================

/// `tracing` layer that forwards events to a [`LogSink`]
pub struct SinkLayer {
    sink: Arc<LogSink>,
}

impl SinkLayer {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn register_callsite(&self, _metadata: &'static Metadata<'static>) -> Interest {
        // The threshold can change at runtime, so never cache the decision
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.sink.is_enabled(LogLevel::from(*metadata.level()))
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        if !self.sink.is_enabled(level) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink.emit(level, &visitor.finish());
    }
}

/// Collects the `message` field plus `key=value` pairs for the rest
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let mut out = self.message;
        for field in self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&field);
        }
        out
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Install the global subscriber with `sink` as its only destination
pub fn init_tracing(sink: Arc<LogSink>) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(SinkLayer::new(sink))
        .try_init()
}
