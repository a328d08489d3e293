//! Embeddable script engine
//!
//! A small Python-flavoured interpreter whose heap is carved out of a single
//! capability. The engine knows nothing about the boundary that hosts it:
//! embedders add native types through [`NativeObject`], keep extra objects
//! alive through [`RootSource`], and catch hardware faults by resolving unwind
//! values with [`Vm::resolve_unwind`].
//!
//! ```text
//! source -> lexer -> parser -> AST -> Vm (tree walk) -> heap
//! ```

pub mod ast;
pub mod builtins;
pub mod error;
pub mod heap;
pub mod interp;
pub mod lexer;
pub mod native;
pub mod output;
pub mod parser;
pub mod value;

pub use ast::{BinOp, CmpOp, UnaryOp};
pub use builtins::Builtin;
pub use error::{Exception, ExecResult, InitError, SyntaxError};
pub use heap::{EmergencyBuffer, GcStats, HeapStats, TracebackEntry, EMERGENCY_RESERVE};
pub use interp::{EngineConfig, Vm, MIN_HEAP_SIZE};
pub use lexer::needs_more_input;
pub use native::{NativeObject, RootSource};
pub use output::{OutputSink, SharedBuffer};
pub use parser::{parse, Mode};
pub use value::{ExcKind, ObjRef, Value};
