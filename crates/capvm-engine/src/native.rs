//! Native object types and extra collector roots
//!
//! Embedders extend the engine with their own value types by implementing
//! [`NativeObject`] and allocating instances through
//! [`Vm::alloc_native`](crate::Vm::alloc_native). Values the engine cannot
//! see from its own state (globals, frames, temporaries) are kept alive by
//! registering a [`RootSource`].

use std::any::Any;

use crate::ast::{BinOp, CmpOp, UnaryOp};
use crate::error::ExecResult;
use crate::interp::Vm;
use crate::value::Value;

/// A script-visible object implemented in Rust.
///
/// Every hook has a default that reports the operation as unsupported, so a
/// type implements only what it means.
pub trait NativeObject {
    /// Name used in `repr` and in error messages.
    fn type_name(&self) -> &'static str;

    fn repr(&self) -> String;

    fn truthy(&self) -> bool {
        true
    }

    /// Conversion for `int(obj)`.
    fn to_int(&self) -> Option<i64> {
        None
    }

    fn hash(&self) -> Option<i64> {
        None
    }

    fn unary_op(&self, _op: UnaryOp) -> Option<Value> {
        None
    }

    /// `self <op> rhs`; `None` means the operand types are unsupported.
    fn binary_op(&self, _vm: &mut Vm, _op: BinOp, _rhs: Value) -> Option<ExecResult<Value>> {
        None
    }

    /// `self <op> rhs`; `None` means the operand types are unsupported.
    fn compare(&self, _vm: &Vm, _op: CmpOp, _rhs: Value) -> Option<bool> {
        None
    }

    fn call(&self, vm: &mut Vm, _args: &[Value]) -> ExecResult<Value> {
        let message = format!("'{}' object isn't callable", self.type_name());
        Err(vm.new_error(crate::ExcKind::TypeError, message))
    }

    fn call_method(&self, vm: &mut Vm, name: &str, _args: &[Value]) -> ExecResult<Value> {
        let message = format!("'{}' object has no attribute '{}'", self.type_name(), name);
        Err(vm.new_error(crate::ExcKind::AttributeError, message))
    }

    /// Values this object keeps alive.
    fn trace(&self, _out: &mut Vec<Value>) {}

    /// Bytes charged against the heap for this object.
    fn size_hint(&self) -> u32 {
        16
    }

    fn as_any(&self) -> &dyn Any;
}

/// Extra roots scanned at every collection.
pub trait RootSource {
    fn roots(&self, out: &mut Vec<Value>);
}
