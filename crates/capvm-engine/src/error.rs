//! Engine error types

use capvm_arch::Capability;

use crate::value::ObjRef;

/// A lexing or parsing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    pub line: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        SyntaxError {
            line,
            message: message.into(),
        }
    }
}

/// Failure to bring up an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("heap capability {0:?} is not usable")]
    InvalidHeap(Capability),

    #[error("heap of {size} bytes is smaller than the {minimum} byte minimum")]
    HeapTooSmall { size: u32, minimum: u32 },
}

/// A raised script exception, referring to an exception object on the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception(pub(crate) ObjRef);

impl Exception {
    pub fn object(&self) -> ObjRef {
        self.0
    }
}

/// Result of anything that can raise.
pub type ExecResult<T> = Result<T, Exception>;
