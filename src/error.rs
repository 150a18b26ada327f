//! Error taxonomy for the batch engine
//!
//! Every failure a caller can observe from `hash_batch` or engine
//! initialization is one of these variants. Device-step failures
//! (allocation, transfer, launch, execution) are returned only after all
//! staging memory for the failed batch has been released.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine and its devices.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller broke a contract before any work was done
    /// (wrong buffer length, bad configuration).
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The engine has no usable device: never initialized, shut down,
    /// or its initialization failed.
    #[error("engine not ready: {0}")]
    EngineNotReady(String),

    #[error("failed to allocate {bytes} bytes of staging memory: {reason}")]
    AllocationFailed { bytes: usize, reason: String },

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("kernel execution failed: {0}")]
    ExecutionFailed(String),

    #[error("device initialization failed: {0}")]
    InitializationFailed(String),

    #[error("no suitable compute device found")]
    NoSuitableDevice,

    #[error("invalid kernel binary: {0}")]
    InvalidKernel(String),

    #[error("failed to load kernel: {0}")]
    KernelLoadFailed(String),
}

/// Fieldless view of [`EngineError`], for matching on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PreconditionViolation,
    EngineNotReady,
    AllocationFailed,
    TransferFailed,
    LaunchFailed,
    ExecutionFailed,
    Initialization,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::PreconditionViolation(_) => ErrorKind::PreconditionViolation,
            EngineError::EngineNotReady(_) => ErrorKind::EngineNotReady,
            EngineError::AllocationFailed { .. } => ErrorKind::AllocationFailed,
            EngineError::TransferFailed(_) => ErrorKind::TransferFailed,
            EngineError::LaunchFailed(_) => ErrorKind::LaunchFailed,
            EngineError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            EngineError::InitializationFailed(_)
            | EngineError::NoSuitableDevice
            | EngineError::InvalidKernel(_)
            | EngineError::KernelLoadFailed(_) => ErrorKind::Initialization,
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        EngineError::PreconditionViolation(msg.into())
    }
}

#[cfg(feature = "python")]
impl From<EngineError> for pyo3::PyErr {
    fn from(err: EngineError) -> Self {
        match err.kind() {
            ErrorKind::PreconditionViolation => {
                pyo3::exceptions::PyValueError::new_err(err.to_string())
            }
            _ => pyo3::exceptions::PyRuntimeError::new_err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_groups_initialization_errors() {
        assert_eq!(EngineError::NoSuitableDevice.kind(), ErrorKind::Initialization);
        assert_eq!(
            EngineError::InvalidKernel("bad magic".into()).kind(),
            ErrorKind::Initialization
        );
        assert_eq!(
            EngineError::AllocationFailed { bytes: 33, reason: "oom".into() }.kind(),
            ErrorKind::AllocationFailed
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::AllocationFailed { bytes: 330, reason: "limit".into() };
        let msg = err.to_string();
        assert!(msg.contains("330"), "got: {}", msg);
        assert!(msg.contains("limit"), "got: {}", msg);
    }
}
