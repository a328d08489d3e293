//! Conversion between native slots and script values
//!
//! Going in, arguments are checked against the signature first, with no
//! side effects, and only then converted; a conversion can still raise
//! `MemoryError` once the engine is running. Coming out, a value that does
//! not fit its tag is a [`BoundaryError::BadSignature`].

use std::cell::RefCell;
use std::rc::Rc;

use capvm_arch::Capability;
use capvm_engine::{ExecResult, Value, Vm};

use crate::callback::{Callback, CallbackObject};
use crate::capability::{cap_of, new_cap};
use crate::error::{BoundaryError, BoundaryResult};
use crate::export::ExportTable;
use crate::native::{NativeValue, StrView};
use crate::signature::{Signature, TypeTag};

/// Validates `args` against `signature` without touching any state.
pub fn check_args(signature: &Signature, args: &[NativeValue], exports: &ExportTable) -> BoundaryResult<()> {
    if args.len() != signature.arity() {
        return Err(BoundaryError::BadSignature(format!(
            "signature \"{}\" takes {} arguments but {} were given",
            signature,
            signature.arity(),
            args.len()
        )));
    }
    for (i, (tag, arg)) in signature.args().iter().zip(args).enumerate() {
        if arg.tag() != *tag {
            return Err(BoundaryError::BadSignature(format!(
                "argument {} is {} but signature \"{}\" wants {}",
                i,
                arg.tag(),
                signature,
                tag
            )));
        }
        if let NativeValue::Object(token) = arg {
            if !exports.contains(*token) {
                return Err(BoundaryError::InvalidHandle(*token));
            }
        }
    }
    Ok(())
}

/// Native slot to script value.
pub fn to_script(vm: &mut Vm, exports: &Rc<RefCell<ExportTable>>, value: &NativeValue) -> ExecResult<Value> {
    match value {
        NativeValue::Void | NativeValue::Str(None) => Ok(Value::None),
        NativeValue::Int(i) => Ok(Value::Int(i64::from(*i))),
        NativeValue::Uint(u) => Ok(Value::Int(i64::from(*u))),
        NativeValue::Float(x) => Ok(Value::Float(f64::from(*x))),
        NativeValue::Double(x) => Ok(Value::Float(*x)),
        NativeValue::Str(Some(view)) => vm.new_str(view.as_str()),
        NativeValue::Ptr(cap) => new_cap(vm, *cap),
        NativeValue::Object(token) => Ok(exports.borrow().resolve(*token).unwrap_or(Value::None)),
        NativeValue::Callback(cb) => vm.alloc_native(Rc::new(CallbackObject::new(cb.clone(), Rc::clone(exports)))),
    }
}

fn int_of(value: Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(i),
        Value::Bool(b) => Some(i64::from(b)),
        _ => None,
    }
}

fn float_of(value: Value) -> Option<f64> {
    match value {
        Value::Float(x) => Some(x),
        other => int_of(other).map(|i| i as f64),
    }
}

fn callback_of(vm: &Vm, value: Value) -> Option<Callback> {
    vm.native(value)?
        .as_any()
        .downcast_ref::<CallbackObject>()
        .map(|cb| cb.callback().clone())
}

/// Script value to native slot. Exporting (`O`) is the only conversion with
/// a side effect: it links a new node into `exports`.
pub fn from_script(
    vm: &Vm,
    exports: &RefCell<ExportTable>,
    tag: TypeTag,
    value: Value,
) -> BoundaryResult<NativeValue> {
    let mismatch = || {
        BoundaryError::BadSignature(format!(
            "cannot convert '{}' to {}",
            vm.type_name(value),
            tag
        ))
    };
    Ok(match tag {
        TypeTag::Void => NativeValue::Void,
        TypeTag::Int => NativeValue::Int(int_of(value).ok_or_else(mismatch)? as i32),
        TypeTag::Uint => NativeValue::Uint(int_of(value).ok_or_else(mismatch)? as u32),
        TypeTag::Float => NativeValue::Float(float_of(value).ok_or_else(mismatch)? as f32),
        TypeTag::Double => NativeValue::Double(float_of(value).ok_or_else(mismatch)?),
        TypeTag::Str if value.is_none() => NativeValue::Str(None),
        TypeTag::Str => {
            let text = vm.str_value(value).ok_or_else(mismatch)?;
            let obj = value.as_obj().ok_or_else(mismatch)?;
            NativeValue::Str(Some(StrView::lend(vm.pointer(obj), text)))
        }
        TypeTag::Ptr => match cap_of(vm, value) {
            Some(cap) => NativeValue::Ptr(cap),
            None => NativeValue::Ptr(Capability::from_address(int_of(value).ok_or_else(mismatch)? as u32)),
        },
        TypeTag::Object => NativeValue::Object(exports.borrow_mut().export(value)?),
        TypeTag::Callback => NativeValue::Callback(callback_of(vm, value).ok_or_else(mismatch)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvm_arch::{Allocator, Compartment, Permissions, SObj};
    use capvm_engine::EngineConfig;

    struct Fixture {
        vm: Vm,
        exports: Rc<RefCell<ExportTable>>,
        allocator: Allocator,
    }

    fn fixture() -> Fixture {
        let allocator = Allocator::with_quota(0x4000);
        let heap = allocator.alloc(0x2000).unwrap();
        Fixture {
            vm: Vm::new(heap, EngineConfig::default()).unwrap(),
            exports: Rc::new(RefCell::new(ExportTable::new(allocator.clone()))),
            allocator,
        }
    }

    fn round_trip(f: &mut Fixture, value: NativeValue) -> NativeValue {
        let tag = value.tag();
        let script = to_script(&mut f.vm, &f.exports, &value).unwrap();
        from_script(&f.vm, &f.exports, tag, script).unwrap()
    }

    #[test]
    fn test_scalars_round_trip() {
        let mut f = fixture();
        assert_eq!(round_trip(&mut f, NativeValue::Int(42)), NativeValue::Int(42));
        assert_eq!(round_trip(&mut f, NativeValue::Int(-7)), NativeValue::Int(-7));
        assert_eq!(round_trip(&mut f, NativeValue::Uint(u32::MAX)), NativeValue::Uint(u32::MAX));
        assert_eq!(round_trip(&mut f, NativeValue::Float(3.5)), NativeValue::Float(3.5));
        assert_eq!(round_trip(&mut f, NativeValue::Double(-0.25)), NativeValue::Double(-0.25));
        assert_eq!(round_trip(&mut f, NativeValue::Void), NativeValue::Void);
    }

    #[test]
    fn test_string_comes_back_as_read_only_view() {
        let mut f = fixture();
        let buffer = f.allocator.alloc(8).unwrap();
        let view = StrView::copy_into(buffer, "hi").unwrap();
        let back = round_trip(&mut f, NativeValue::Str(Some(view)));
        assert_eq!(back.as_str(), Some("hi"));
        let NativeValue::Str(Some(back)) = back else {
            panic!("not a string");
        };
        assert!(!back.capability().perms().contains(Permissions::STORE));
        assert_eq!(back.capability().length(), 2);
        assert_eq!(round_trip(&mut f, NativeValue::Str(None)), NativeValue::Str(None));
    }

    #[test]
    fn test_capability_is_preserved_exactly() {
        let mut f = fixture();
        let cap = f.allocator.alloc(24).unwrap().offset(8).restrict(Permissions::LOAD);
        assert_eq!(round_trip(&mut f, NativeValue::Ptr(cap)), NativeValue::Ptr(cap));
    }

    #[test]
    fn test_integer_becomes_untagged_pointer() {
        let f = fixture();
        let out = from_script(&f.vm, &f.exports, TypeTag::Ptr, Value::Int(0x1234)).unwrap();
        let cap = out.as_ptr().unwrap();
        assert_eq!(cap.address(), 0x1234);
        assert!(!cap.is_tagged());
    }

    #[test]
    fn test_object_export_resolves_to_same_value() {
        let mut f = fixture();
        let s = f.vm.new_str("kept").unwrap();
        let token = from_script(&f.vm, &f.exports, TypeTag::Object, s).unwrap();
        let again = to_script(&mut f.vm, &f.exports, &token).unwrap();
        assert_eq!(again, s);
    }

    #[test]
    fn test_callback_round_trip_keeps_identity() {
        let mut f = fixture();
        let cb = Callback::from_fn(&Compartment::new("native"), "v", |_| NativeValue::Void).unwrap();
        let back = round_trip(&mut f, NativeValue::Callback(cb.clone()));
        assert_eq!(back, NativeValue::Callback(cb));
    }

    #[test]
    fn test_mismatches_are_bad_signatures() {
        let mut f = fixture();
        let s = f.vm.new_str("x").unwrap();
        assert!(matches!(
            from_script(&f.vm, &f.exports, TypeTag::Int, s),
            Err(BoundaryError::BadSignature(_))
        ));
        assert!(matches!(
            from_script(&f.vm, &f.exports, TypeTag::Str, Value::Int(1)),
            Err(BoundaryError::BadSignature(_))
        ));
        assert!(matches!(
            from_script(&f.vm, &f.exports, TypeTag::Callback, Value::Int(1)),
            Err(BoundaryError::BadSignature(_))
        ));
    }

    #[test]
    fn test_check_args() {
        let f = fixture();
        let table = f.exports.borrow();
        let sig = Signature::parse("vis").unwrap();
        assert!(check_args(&sig, &[NativeValue::Int(1), NativeValue::Str(None)], &table).is_ok());
        assert!(matches!(
            check_args(&sig, &[NativeValue::Int(1)], &table),
            Err(BoundaryError::BadSignature(_))
        ));
        assert!(matches!(
            check_args(&sig, &[NativeValue::Uint(1), NativeValue::Str(None)], &table),
            Err(BoundaryError::BadSignature(_))
        ));
        let sig = Signature::parse("vO").unwrap();
        assert_eq!(
            check_args(&sig, &[NativeValue::Object(SObj::INVALID)], &table),
            Err(BoundaryError::InvalidHandle(SObj::INVALID))
        );
    }
}
