//! Unified error handling for the mavrpt relay
//!
//! Every layer keeps its own `thiserror` enum; at the service boundary those are
//! folded into [`BridgeError`], which decides the process exit code.

use thiserror::Error;

// ============================================================================
// ErrorCategory - coarse classification used for exit codes and log levels
// ============================================================================

/// Coarse error classes of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resolved configuration is unusable
    Configuration,
    /// A transport could not be brought up before the relay loop started
    Setup,
    /// The readiness wait itself failed while the loop was running
    Scheduler,
    /// Anything else (daemonization, runtime construction, ...)
    Internal,
}

// ============================================================================
// BridgeError - Main error type
// ============================================================================

/// Main error type returned by the relay service entry points
#[derive(Debug, Error)]
pub enum BridgeError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Setup Errors (fatal before the loop starts)
    // ======================================
    #[error("Serial setup failed: {device}: {reason}")]
    SerialSetup { device: String, reason: String },

    #[error("Network setup failed: {endpoint}: {reason}")]
    NetworkSetup { endpoint: String, reason: String },

    // ======================================
    // Scheduler Errors (fatal while running)
    // ======================================
    #[error("Readiness wait failed: {0}")]
    Scheduler(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Daemonization failed: {0}")]
    Daemonize(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Process exit code for a clean shutdown
pub const EXIT_OK: i32 = 0;
/// Process exit code for configuration or transport setup failures
pub const EXIT_SETUP_FAILURE: i32 = 1;
/// Process exit code for a readiness-wait failure after the loop started
pub const EXIT_SCHEDULER_FAILURE: i32 = 2;

impl BridgeError {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::SerialSetup { .. } | Self::NetworkSetup { .. } => ErrorCategory::Setup,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Daemonize(_) | Self::Runtime(_) | Self::Io(_) | Self::Other(_) => {
                ErrorCategory::Internal
            },
        }
    }

    /// Whether the error prevented the relay loop from ever starting
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Setup
        )
    }

    /// Exit code reported to the operator / init system
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Scheduler => EXIT_SCHEDULER_FAILURE,
            ErrorCategory::Configuration | ErrorCategory::Setup | ErrorCategory::Internal => {
                EXIT_SETUP_FAILURE
            },
        }
    }
}
