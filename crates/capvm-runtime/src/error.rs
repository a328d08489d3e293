//! Error types for the compartment boundary

use capvm_arch::{AllocError, CallFault, SObj};
use capvm_engine::{ExcKind, InitError};

/// Result type for boundary entry points
pub type BoundaryResult<T> = Result<T, BoundaryError>;

/// Why a boundary call failed.
///
/// Every variant reports the same `-1` status to status-style callers; the
/// variant itself says what went wrong.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoundaryError {
    /// The handle does not unseal with the authority of this boundary
    #[error("handle {0:?} does not unseal")]
    InvalidHandle(SObj),

    /// Signature string or argument list rejected before the call started
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Quota or heap exhaustion; everything allocated so far was released
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// A script exception reached the boundary's protected region
    #[error("uncaught {kind:?}: {message}")]
    UncaughtScriptException {
        /// Exception type
        kind: ExcKind,
        /// `str()` of the exception
        message: String,
    },

    /// A hardware fault surfaced as an uncaught `OSError`
    #[error("hardware fault (mcause {mcause:#x}, mtval {mtval:#x})")]
    HardwareFault {
        /// Trap cause
        mcause: u32,
        /// Trap detail
        mtval: u32,
    },

    /// The call was unwound to the compartment boundary
    #[error("call was forcibly unwound")]
    ForcedUnwind,

    /// The compartment halted
    #[error("compartment halted after a double fault")]
    DoubleFault,

    /// The context is already running a call further up the stack
    #[error("context is already executing")]
    ContextBusy,

    /// The heap behind a context is no longer valid
    #[error("context heap has been revoked")]
    HeapRevoked,
}

impl BoundaryError {
    /// Status word for status-style callers.
    pub fn status(&self) -> i32 {
        -1
    }
}

/// `0` on success, `-1` on any failure.
pub fn status_of<T>(result: &BoundaryResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status(),
    }
}

impl From<CallFault> for BoundaryError {
    fn from(fault: CallFault) -> Self {
        match fault {
            CallFault::ForcedUnwind => BoundaryError::ForcedUnwind,
            CallFault::DoubleFault => BoundaryError::DoubleFault,
        }
    }
}

impl From<AllocError> for BoundaryError {
    fn from(err: AllocError) -> Self {
        BoundaryError::AllocationFailure(err.to_string())
    }
}

impl From<InitError> for BoundaryError {
    fn from(err: InitError) -> Self {
        BoundaryError::AllocationFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_is_minus_one() {
        let errors = [
            BoundaryError::InvalidHandle(SObj::INVALID),
            BoundaryError::BadSignature("x".into()),
            BoundaryError::ForcedUnwind,
            BoundaryError::DoubleFault,
            BoundaryError::ContextBusy,
            BoundaryError::HeapRevoked,
        ];
        for err in errors {
            assert_eq!(err.status(), -1);
        }
        assert_eq!(status_of(&Ok::<(), BoundaryError>(())), 0);
    }

    #[test]
    fn test_call_fault_conversion() {
        assert_eq!(BoundaryError::from(CallFault::ForcedUnwind), BoundaryError::ForcedUnwind);
        assert_eq!(BoundaryError::from(CallFault::DoubleFault), BoundaryError::DoubleFault);
    }
}
