//! Native closures callable from scripts
//!
//! A [`Callback`] pairs a native function and its data with a signature and
//! the compartment the function lives in. Scripts see it as a callable
//! object; each call marshals the script arguments out, runs the function
//! through the switcher into its home compartment and marshals the result
//! back in.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use capvm_arch::{CallFault, Compartment};
use capvm_engine::{ExcKind, ExecResult, NativeObject, Value, Vm};

use crate::error::BoundaryResult;
use crate::export::ExportTable;
use crate::marshal;
use crate::native::NativeValue;
use crate::signature::{Signature, TypeTag};

/// Native entry point: the callback's data, then one slot per argument.
pub type CallbackFn = fn(&dyn Any, &[NativeValue]) -> NativeValue;

type BoxedFn = Box<dyn Fn(&[NativeValue]) -> NativeValue>;

fn call_boxed(data: &dyn Any, args: &[NativeValue]) -> NativeValue {
    match data.downcast_ref::<BoxedFn>() {
        Some(f) => f(args),
        None => NativeValue::Void,
    }
}

/// Immutable once built; clones share the function and data.
#[derive(Clone)]
pub struct Callback {
    func: CallbackFn,
    data: Rc<dyn Any>,
    signature: Rc<Signature>,
    home: Compartment,
}

impl Callback {
    pub fn new(home: &Compartment, signature: &str, func: CallbackFn, data: Rc<dyn Any>) -> BoundaryResult<Self> {
        Ok(Callback {
            func,
            data,
            signature: Rc::new(Signature::parse(signature)?),
            home: home.clone(),
        })
    }

    /// Wraps a closure; its captures play the part of the data pointer.
    pub fn from_fn<F>(home: &Compartment, signature: &str, f: F) -> BoundaryResult<Self>
    where
        F: Fn(&[NativeValue]) -> NativeValue + 'static,
    {
        let data: Rc<dyn Any> = Rc::new(Box::new(f) as BoxedFn);
        Self::new(home, signature, call_boxed, data)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn n_args(&self) -> usize {
        self.signature.arity()
    }

    pub fn home(&self) -> &Compartment {
        &self.home
    }

    pub fn data(&self) -> &Rc<dyn Any> {
        &self.data
    }

    /// Runs the function inside its home compartment.
    pub fn invoke(&self, args: &[NativeValue]) -> Result<NativeValue, CallFault> {
        self.home.call(|| (self.func)(&*self.data, args))
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data) && self.signature == other.signature
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("signature", &self.signature.to_string())
            .field("home", &self.home.name())
            .finish()
    }
}

/// Script-side face of a [`Callback`].
pub struct CallbackObject {
    callback: Callback,
    exports: Rc<RefCell<ExportTable>>,
}

impl CallbackObject {
    pub(crate) fn new(callback: Callback, exports: Rc<RefCell<ExportTable>>) -> Self {
        CallbackObject { callback, exports }
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    fn bad_signature(vm: &mut Vm) -> capvm_engine::Exception {
        vm.new_error(ExcKind::TypeError, "Bad callback signature")
    }
}

impl NativeObject for CallbackObject {
    fn type_name(&self) -> &'static str {
        "callback"
    }

    fn repr(&self) -> String {
        format!(
            "<callback '{}' in compartment '{}'>",
            self.callback.signature,
            self.callback.home.name()
        )
    }

    fn call(&self, vm: &mut Vm, args: &[Value]) -> ExecResult<Value> {
        let signature = self.callback.signature();
        if args.len() != signature.arity() {
            let message = format!(
                "function takes {} positional arguments but {} were given",
                signature.arity(),
                args.len()
            );
            return Err(vm.new_error(ExcKind::TypeError, message));
        }

        // Exports are made only once every other argument has converted.
        let mut native_args = Vec::with_capacity(args.len());
        for (tag, arg) in signature.args().iter().zip(args) {
            if *tag == TypeTag::Object {
                native_args.push(NativeValue::Void);
                continue;
            }
            match marshal::from_script(vm, &self.exports, *tag, *arg) {
                Ok(value) => native_args.push(value),
                Err(err) => {
                    log::debug!("callback argument rejected: {}", err);
                    return Err(Self::bad_signature(vm));
                }
            }
        }
        let mut exported = Vec::new();
        for ((tag, arg), slot) in signature.args().iter().zip(args).zip(native_args.iter_mut()) {
            if *tag != TypeTag::Object {
                continue;
            }
            match marshal::from_script(vm, &self.exports, *tag, *arg) {
                Ok(value) => {
                    if let NativeValue::Object(token) = value {
                        exported.push(token);
                    }
                    *slot = value;
                }
                Err(err) => {
                    let mut exports = self.exports.borrow_mut();
                    for token in exported {
                        exports.free(token);
                    }
                    log::debug!("callback argument could not be exported: {}", err);
                    return Err(vm.new_error(ExcKind::MemoryError, "memory allocation failed"));
                }
            }
        }

        let ret = match self.callback.invoke(&native_args) {
            Ok(ret) => ret,
            Err(fault) => {
                let home = self.callback.home.name();
                log::warn!("callback into '{}' failed: {}", home, fault);
                let message = format!("callback into '{}' failed: {}", home, fault);
                return Err(vm.new_error(ExcKind::RuntimeError, message));
            }
        };

        match (signature.ret(), ret) {
            (TypeTag::Void, NativeValue::Void) | (TypeTag::Str, NativeValue::Str(None)) => Ok(Value::None),
            (tag, ret) if ret.tag() != tag => Err(Self::bad_signature(vm)),
            (_, NativeValue::Object(token)) => Ok(self.exports.borrow().resolve(token).unwrap_or(Value::None)),
            (_, ret) => marshal::to_script(vm, &self.exports, &ret),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fn_runs_in_home_compartment() {
        let home = Compartment::new("native");
        let seen = home.clone();
        let cb = Callback::from_fn(&home, "ii", move |args| {
            assert!(capvm_arch::hart::current().is_some_and(|c| c.same_as(&seen)));
            NativeValue::Int(args[0].as_int().unwrap_or(0) * 2)
        })
        .unwrap();
        assert_eq!(cb.n_args(), 1);
        assert_eq!(cb.signature().ret(), TypeTag::Int);
        assert_eq!(cb.invoke(&[NativeValue::Int(21)]), Ok(NativeValue::Int(42)));
    }

    #[test]
    fn test_fn_pointer_with_data() {
        fn add_bias(data: &dyn Any, args: &[NativeValue]) -> NativeValue {
            let bias = data.downcast_ref::<i32>().copied().unwrap_or(0);
            NativeValue::Int(args[0].as_int().unwrap_or(0) + bias)
        }
        let home = Compartment::new("native");
        let cb = Callback::new(&home, "ii", add_bias, Rc::new(100i32)).unwrap();
        assert_eq!(cb.invoke(&[NativeValue::Int(1)]), Ok(NativeValue::Int(101)));
        assert_eq!(cb.clone(), cb);
    }

    #[test]
    fn test_bad_signature_is_rejected_at_construction() {
        let home = Compartment::new("native");
        assert!(Callback::from_fn(&home, "q", |_| NativeValue::Void).is_err());
    }
}
