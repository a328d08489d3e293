//! Typed access to a context
//!
//! [`Context`] owns a handle and destroys it on drop. [`Context::call`]
//! derives the signature string from the Rust types of its arguments and
//! return value, then goes through the same tag dispatch as
//! [`VmCompartment::execute_named`].
//!
//! ```ignore
//! let vm = VmCompartment::new(VmConfig::default());
//! let ctx = Context::create_default(&vm)?;
//! ctx.execute_file("def add(a, b):\n    return a + b\n")?;
//! let sum: i32 = ctx.call("add", (2, 3))?;
//! ```

use capvm_arch::{Capability, Compartment, SObj};
use capvm_engine::GcStats;

use crate::callback::Callback;
use crate::error::{BoundaryError, BoundaryResult};
use crate::native::{NativeValue, StrView};
use crate::repl::{Console, ReplExit};
use crate::signature::{Signature, TypeTag};
use crate::vm_compartment::VmCompartment;

/// A Rust type with a fixed signature tag.
pub trait NativeType: Sized {
    const TAG: TypeTag;

    fn into_native(self) -> NativeValue;

    fn from_native(value: NativeValue) -> Option<Self>;
}

macro_rules! native_type {
    ($ty:ty, $tag:ident, $variant:ident) => {
        impl NativeType for $ty {
            const TAG: TypeTag = TypeTag::$tag;

            fn into_native(self) -> NativeValue {
                NativeValue::$variant(self)
            }

            fn from_native(value: NativeValue) -> Option<Self> {
                match value {
                    NativeValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

native_type!(i32, Int, Int);
native_type!(u32, Uint, Uint);
native_type!(f32, Float, Float);
native_type!(f64, Double, Double);
native_type!(Capability, Ptr, Ptr);
native_type!(SObj, Object, Object);
native_type!(Callback, Callback, Callback);
native_type!(Option<StrView>, Str, Str);

impl NativeType for StrView {
    const TAG: TypeTag = TypeTag::Str;

    fn into_native(self) -> NativeValue {
        NativeValue::Str(Some(self))
    }

    fn from_native(value: NativeValue) -> Option<Self> {
        match value {
            NativeValue::Str(view) => view,
            _ => None,
        }
    }
}

/// A return type: `()` for `v`, or any [`NativeType`].
pub trait NativeReturn: Sized {
    const TAG: TypeTag;

    fn into_return(self) -> NativeValue;

    fn from_return(value: NativeValue) -> Option<Self>;
}

impl NativeReturn for () {
    const TAG: TypeTag = TypeTag::Void;

    fn into_return(self) -> NativeValue {
        NativeValue::Void
    }

    fn from_return(_: NativeValue) -> Option<Self> {
        Some(())
    }
}

macro_rules! native_return {
    ($($ty:ty),*) => {
        $(
            impl NativeReturn for $ty {
                const TAG: TypeTag = <$ty as NativeType>::TAG;

                fn into_return(self) -> NativeValue {
                    self.into_native()
                }

                fn from_return(value: NativeValue) -> Option<Self> {
                    <$ty as NativeType>::from_native(value)
                }
            }
        )*
    };
}

native_return!(i32, u32, f32, f64, Capability, SObj, Callback, StrView, Option<StrView>);

/// An argument list: a tuple of up to six [`NativeType`]s.
pub trait NativeArgs: Sized {
    fn tags() -> Vec<TypeTag>;

    fn into_values(self) -> Vec<NativeValue>;

    fn from_values(values: &[NativeValue]) -> Option<Self>;
}

macro_rules! native_args {
    ($($name:ident),*) => {
        impl<$($name: NativeType),*> NativeArgs for ($($name,)*) {
            fn tags() -> Vec<TypeTag> {
                vec![$($name::TAG),*]
            }

            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<NativeValue> {
                let ($($name,)*) = self;
                vec![$($name.into_native()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: &[NativeValue]) -> Option<Self> {
                let mut values = values.iter().cloned();
                let out = ($($name::from_native(values.next()?)?,)*);
                match values.next() {
                    Some(_) => None,
                    None => Some(out),
                }
            }
        }
    };
}

native_args!();
native_args!(A);
native_args!(A, B);
native_args!(A, B, C);
native_args!(A, B, C, D);
native_args!(A, B, C, D, E);
native_args!(A, B, C, D, E, F);

fn signature_of<R: NativeReturn, A: NativeArgs>() -> BoundaryResult<Signature> {
    Signature::new(R::TAG, A::tags())
}

/// Builds a callback whose signature follows from `f`'s types.
pub fn typed_callback<R, A, F>(home: &Compartment, f: F) -> BoundaryResult<Callback>
where
    R: NativeReturn,
    A: NativeArgs,
    F: Fn(A) -> R + 'static,
{
    let signature = signature_of::<R, A>()?;
    Callback::from_fn(home, &signature.to_string(), move |args| match A::from_values(args) {
        Some(args) => f(args).into_return(),
        None => NativeValue::Void,
    })
}

/// A context that is destroyed when dropped.
pub struct Context<'vm> {
    vm: &'vm VmCompartment,
    handle: SObj,
}

impl<'vm> Context<'vm> {
    pub fn create(vm: &'vm VmCompartment, heap_size: u32) -> BoundaryResult<Self> {
        let handle = vm.create(heap_size)?;
        Ok(Context { vm, handle })
    }

    /// Creates a context with the configured default heap size.
    pub fn create_default(vm: &'vm VmCompartment) -> BoundaryResult<Self> {
        Self::create(vm, vm.config().heap_size)
    }

    pub fn handle(&self) -> SObj {
        self.handle
    }

    /// Gives up ownership without destroying the context.
    pub fn into_handle(self) -> SObj {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }

    pub fn restart(&self) -> BoundaryResult<()> {
        self.vm.restart(self.handle)
    }

    pub fn execute_statement(&self, source: &str) -> BoundaryResult<()> {
        self.vm.execute_statement(self.handle, source)
    }

    pub fn execute_file(&self, source: &str) -> BoundaryResult<()> {
        self.vm.execute_file(self.handle, source)
    }

    pub fn execute_frozen(&self, name: &str) -> BoundaryResult<()> {
        self.vm.execute_frozen(self.handle, name)
    }

    /// Calls the global function `name`.
    pub fn call<R: NativeReturn, A: NativeArgs>(&self, name: &str, args: A) -> BoundaryResult<R> {
        let signature = signature_of::<R, A>()?;
        let ret = self
            .vm
            .execute_named(self.handle, name, &signature.to_string(), &args.into_values())?;
        let tag = ret.tag();
        R::from_return(ret).ok_or_else(|| {
            BoundaryError::BadSignature(format!("'{}' returned {} but {} was expected", name, tag, R::TAG))
        })
    }

    pub fn free_exported_handle(&self, token: SObj) -> BoundaryResult<()> {
        self.vm.free_exported_handle(self.handle, token)
    }

    pub fn collect_garbage(&self) -> BoundaryResult<GcStats> {
        self.vm.collect_garbage(self.handle)
    }

    pub fn repl(&self, console: &mut dyn Console) -> BoundaryResult<ReplExit> {
        self.vm.run_auto_repl(self.handle, console)
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.vm.destroy(self.handle) {
            log::debug!("context {:?} was already gone: {}", self.handle, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_follow_types() {
        assert_eq!(<(i32, f64, StrView)>::tags(), vec![TypeTag::Int, TypeTag::Double, TypeTag::Str]);
        assert_eq!(<()>::tags(), Vec::<TypeTag>::new());
        assert_eq!(signature_of::<(), (u32, SObj)>().unwrap().to_string(), "vIO");
        assert_eq!(signature_of::<Capability, ()>().unwrap().to_string(), "P");
    }

    #[test]
    fn test_values_round_trip_through_tuples() {
        let values = (7i32, 2.5f32).into_values();
        assert_eq!(values, vec![NativeValue::Int(7), NativeValue::Float(2.5)]);
        assert_eq!(<(i32, f32)>::from_values(&values), Some((7, 2.5)));
        assert_eq!(<(i32,)>::from_values(&values), None);
        assert_eq!(<(u32, f32)>::from_values(&values), None);
    }

    #[test]
    fn test_typed_callback_signature() {
        let home = Compartment::new("native");
        let cb = typed_callback(&home, |(a, b): (i32, i32)| a * b).unwrap();
        assert_eq!(cb.signature().to_string(), "iii");
        assert_eq!(
            cb.invoke(&[NativeValue::Int(6), NativeValue::Int(7)]),
            Ok(NativeValue::Int(42))
        );
    }
}
