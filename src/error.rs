//! Unified error handling for device-arbiter
//!
//! Every fallible operation of the crate returns [`ArbiterError`]. Errors are
//! grouped into categories so the VM can decide how to react:
//! - NotAvailable: take the host fallback path, never log as a failure
//! - Backend: the current batch failed, the process is fine
//! - Misuse: programmer error detected at runtime
//! - Configuration: bad settings at run start
//! - Internal: bugs

use std::fmt;

use crate::device::Device;

/// Unified error type for device-arbiter
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    // ========== Fallback signals ==========
    /// No pooled slab of this exact class on this device
    #[error("no pooled slab of {size} bytes on {device}")]
    NotAvailable { device: Device, size: usize },

    /// No batched-call backend is configured for this run
    #[error("no batched-call backend configured")]
    NoBackend,

    // ========== Backend errors ==========
    /// The device backend reported a failure while running a batch
    #[error("backend '{backend}' failed batch {batch}: {reason}")]
    BackendFailure {
        backend: String,
        batch: u64,
        reason: String,
    },

    /// The backend worker thread could not be started
    #[error("failed to spawn backend worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    // ========== Misuse ==========
    /// Work submitted after the backend was cleaned up
    #[error("backend already shut down")]
    BackendShutdown,

    /// Caller broke the contract (detected, pool left intact)
    #[error("misuse: {0}")]
    Misuse(String),

    // ========== Configuration ==========
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal ==========
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArbiterError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArbiterError::NotAvailable { .. } | ArbiterError::NoBackend => {
                ErrorCategory::NotAvailable
            }
            ArbiterError::BackendFailure { .. } | ArbiterError::WorkerSpawn(_) => {
                ErrorCategory::Backend
            }
            ArbiterError::BackendShutdown | ArbiterError::Misuse(_) => ErrorCategory::Misuse,
            ArbiterError::InvalidConfiguration(_) => ErrorCategory::Configuration,
            ArbiterError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// True when the caller should simply use its fallback path
    pub fn is_not_available(&self) -> bool {
        matches!(self.category(), ErrorCategory::NotAvailable)
    }

    /// True when the current batch is lost but the run may continue
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(self, ArbiterError::BackendFailure { .. })
    }

    /// True when the error points at a bug in the caller or in this crate
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Misuse | ErrorCategory::Internal
        )
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Non-fatal, use the fallback path
    NotAvailable,
    /// Device backend failure, fatal to a batch only
    Backend,
    /// Contract violation by the caller
    Misuse,
    /// Invalid settings
    Configuration,
    /// Bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::NotAvailable => write!(f, "NotAvailable"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Misuse => write!(f, "Misuse"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Result alias used across the crate
pub type ArbiterResult<T> = std::result::Result<T, ArbiterError>;

/// Build a [`ArbiterError::BackendFailure`]
///
/// # Examples
/// ```ignore
/// return Err(backend_failure!("threaded", 7, "gemm diverged at row {}", row));
/// ```
#[macro_export]
macro_rules! backend_failure {
    ($backend:expr, $batch:expr, $msg:expr) => {
        $crate::error::ArbiterError::BackendFailure {
            backend: $backend.to_string(),
            batch: $batch,
            reason: $msg.to_string(),
        }
    };
    ($backend:expr, $batch:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::ArbiterError::BackendFailure {
            backend: $backend.to_string(),
            batch: $batch,
            reason: format!($fmt, $($arg)*),
        }
    };
}

/// Build an [`ArbiterError::Internal`]
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ArbiterError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ArbiterError::Internal(format!($fmt, $($arg)*))
    };
}

/// Build an [`ArbiterError::InvalidConfiguration`]
pub fn config_err(msg: impl Into<String>) -> ArbiterError {
    ArbiterError::InvalidConfiguration(msg.into())
}
