//! Error taxonomy shared by every public operation.

use thiserror::Error;

/// Failures surfaced by the engine.
///
/// Every public operation either returns its result or one of these; no
/// failure is swallowed, and on every error path all device buffers
/// allocated by the failing operation have already been released.
#[derive(Debug, Error)]
pub enum CugemmError {
    /// The manager's free-memory pre-check failed, or the device
    /// allocation call itself did (the pre-check is advisory, not a
    /// reservation, so a concurrent allocator can still win the race).
    #[error(
        "{op}: out of device memory: requested {requested_bytes} bytes \
         (free {free_bytes} bytes, total {total_bytes} bytes)"
    )]
    OutOfDeviceMemory {
        op: &'static str,
        requested_bytes: usize,
        free_bytes: usize,
        total_bytes: usize,
    },

    /// Operand dimensions violate an algebraic precondition. Raised
    /// before any device allocation, so it has no device side effects.
    #[error("{op}: shape mismatch: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    /// A CUDA driver or cuBLAS call failed. Non-recoverable for the
    /// current operation.
    #[error("device runtime failure in {call}: {detail}")]
    Device { call: &'static str, detail: String },
}

impl CugemmError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        CugemmError::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }

    pub(crate) fn device(call: &'static str, detail: impl Into<String>) -> Self {
        CugemmError::Device {
            call,
            detail: detail.into(),
        }
    }

    pub(crate) fn device_status(call: &'static str, code: i32) -> Self {
        CugemmError::Device {
            call,
            detail: format!("status {code}"),
        }
    }
}

/// Convenience alias for results returned by engine routines.
pub type CugemmResult<T> = Result<T, CugemmError>;
