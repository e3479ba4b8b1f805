//! PID-file bookkeeping

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Default PID-file location
pub const DEFAULT_PID_FILE: &str = "/tmp/mavrpts.pid";

/// A written PID file, removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    removed: bool,
}

impl PidFile {
    /// Write the current process id to `path`
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!("PID file written: {}", path.display());
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Like [`PidFile::create`], but a failure only produces a warning
    pub fn create_or_warn(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match Self::create(path) {
            Ok(pid_file) => Some(pid_file),
            Err(e) => {
                warn!("Cannot write PID file {}: {}", path.display(), e);
                None
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the file; safe to call more than once
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Cannot remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}
