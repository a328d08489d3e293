//! Built-in functions

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::error::ExecResult;
use crate::heap::HeapObject;
use crate::interp::Vm;
use crate::value::{ExcKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Repr,
    Int,
    Float,
    Bool,
    Abs,
    Hex,
    Hash,
    Collect,
}

impl Builtin {
    pub const ALL: [Builtin; 11] = [
        Builtin::Print,
        Builtin::Len,
        Builtin::Str,
        Builtin::Repr,
        Builtin::Int,
        Builtin::Float,
        Builtin::Bool,
        Builtin::Abs,
        Builtin::Hex,
        Builtin::Hash,
        Builtin::Collect,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Repr => "repr",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::Abs => "abs",
            Builtin::Hex => "hex",
            Builtin::Hash => "hash",
            Builtin::Collect => "collect",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

fn arity(vm: &mut Vm, builtin: Builtin, args: &[Value], min: usize, max: usize) -> ExecResult<()> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{} to {}", min, max)
    };
    let message = format!(
        "{}() takes {} positional arguments but {} were given",
        builtin.name(),
        expected,
        args.len()
    );
    Err(vm.new_error(ExcKind::TypeError, message))
}

pub(crate) fn call(vm: &mut Vm, builtin: Builtin, args: &[Value]) -> ExecResult<Value> {
    match builtin {
        Builtin::Print => {
            let mut line = args
                .iter()
                .map(|v| vm.to_str(*v))
                .collect::<Vec<_>>()
                .join(" ");
            line.push('\n');
            vm.write(&line);
            Ok(Value::None)
        }
        Builtin::Len => {
            arity(vm, builtin, args, 1, 1)?;
            let len = vm.len(args[0])?;
            Ok(Value::Int(len as i64))
        }
        Builtin::Str => {
            arity(vm, builtin, args, 0, 1)?;
            match args.first() {
                Some(Value::Obj(r)) if matches!(vm.heap_object(*r), Some(HeapObject::Str(_))) => {
                    Ok(args[0])
                }
                Some(v) => {
                    let text = vm.to_str(*v);
                    vm.new_str(&text)
                }
                None => vm.new_str(""),
            }
        }
        Builtin::Repr => {
            arity(vm, builtin, args, 1, 1)?;
            let text = vm.repr(args[0]);
            vm.new_str(&text)
        }
        Builtin::Int => {
            arity(vm, builtin, args, 0, 2)?;
            match args {
                [] => Ok(Value::Int(0)),
                [v] => int_of(vm, *v, 10),
                [v, base] => {
                    let base = vm.to_int(*base)?;
                    if !(2..=36).contains(&base) {
                        return Err(vm.new_error(ExcKind::ValueError, "int() arg 2 must be >= 2 and <= 36"));
                    }
                    int_of(vm, *v, base as u32)
                }
                _ => unreachable!("arity checked"),
            }
        }
        Builtin::Float => {
            arity(vm, builtin, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(v) => float_of(vm, *v),
            }
        }
        Builtin::Bool => {
            arity(vm, builtin, args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(|v| vm.truthy(*v))))
        }
        Builtin::Abs => {
            arity(vm, builtin, args, 1, 1)?;
            match args[0] {
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| vm.new_error(ExcKind::OverflowError, "small int overflow")),
                Value::Float(x) => Ok(Value::Float(x.abs())),
                other => {
                    let message = format!("unsupported type for abs: '{}'", vm.type_name(other));
                    Err(vm.new_error(ExcKind::TypeError, message))
                }
            }
        }
        Builtin::Hex => {
            arity(vm, builtin, args, 1, 1)?;
            let i = match args[0] {
                Value::Int(i) => i,
                Value::Bool(b) => i64::from(b),
                other => match vm.native(other).and_then(|n| n.to_int()) {
                    Some(i) => i,
                    None => {
                        let message = format!("can't convert {} to int", vm.type_name(other));
                        return Err(vm.new_error(ExcKind::TypeError, message));
                    }
                },
            };
            let text = if i < 0 {
                format!("-0x{:x}", i.unsigned_abs())
            } else {
                format!("0x{:x}", i)
            };
            vm.new_str(&text)
        }
        Builtin::Hash => {
            arity(vm, builtin, args, 1, 1)?;
            hash_of(vm, args[0]).map(Value::Int)
        }
        Builtin::Collect => {
            arity(vm, builtin, args, 0, 0)?;
            vm.collect();
            Ok(Value::None)
        }
    }
}

fn int_of(vm: &mut Vm, value: Value, base: u32) -> ExecResult<Value> {
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(x) => {
            if !x.is_finite() {
                let message = format!("can't convert {} to int", crate::interp::format_float(x));
                return Err(vm.new_error(ExcKind::ValueError, message));
            }
            let truncated = x.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(vm.new_error(ExcKind::OverflowError, "small int overflow"));
            }
            Ok(Value::Int(truncated as i64))
        }
        other => {
            if let Some(text) = vm.str_value(other) {
                let trimmed = text.trim();
                let digits = trimmed.replace('_', "");
                return i64::from_str_radix(&digits, base).map(Value::Int).map_err(|_| {
                    let message = format!("invalid syntax for integer with base {}: '{}'", base, trimmed);
                    vm.new_error(ExcKind::ValueError, message)
                });
            }
            match vm.native(other).and_then(|n| n.to_int()) {
                Some(i) => Ok(Value::Int(i)),
                None => {
                    let message = format!("can't convert {} to int", vm.type_name(other));
                    Err(vm.new_error(ExcKind::TypeError, message))
                }
            }
        }
    }
}

fn float_of(vm: &mut Vm, value: Value) -> ExecResult<Value> {
    match value {
        Value::Float(x) => Ok(Value::Float(x)),
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Bool(b) => Ok(Value::Float(f64::from(u8::from(b)))),
        other => match vm.str_value(other) {
            Some(text) => text.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                let message = format!("invalid syntax for number: '{}'", text.trim());
                vm.new_error(ExcKind::ValueError, message)
            }),
            None => {
                let message = format!("can't convert {} to float", vm.type_name(other));
                Err(vm.new_error(ExcKind::TypeError, message))
            }
        },
    }
}

fn hash_bytes(bytes: &[u8]) -> i64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    (hasher.finish() & 0x3fff_ffff) as i64
}

pub(crate) fn hash_of(vm: &mut Vm, value: Value) -> ExecResult<i64> {
    Ok(match value {
        Value::None => 0x5f5f_4e4f,
        Value::Bool(b) => i64::from(b),
        Value::Int(i) => i,
        Value::Float(x) if x.fract() == 0.0 && x.abs() < 9.0e15 => x as i64,
        Value::Float(x) => hash_bytes(&x.to_bits().to_le_bytes()),
        Value::Builtin(b) => hash_bytes(b.name().as_bytes()),
        Value::ExcType(k) => hash_bytes(k.name().as_bytes()),
        Value::Obj(r) => match vm.heap_object(r) {
            Some(HeapObject::Str(s)) => hash_bytes(s.as_bytes()),
            Some(HeapObject::Bytes(b)) => hash_bytes(b),
            Some(HeapObject::Tuple(items)) => {
                let items = items.clone();
                let mut acc: i64 = 0x345678;
                for item in items.iter() {
                    acc = acc.wrapping_mul(1_000_003) ^ hash_of(vm, *item)?;
                }
                acc & 0x3fff_ffff
            }
            Some(HeapObject::Native(n)) => {
                let n = n.clone();
                match n.hash() {
                    Some(h) => h,
                    None => {
                        let message = format!("unhashable type: '{}'", n.type_name());
                        return Err(vm.new_error(ExcKind::TypeError, message));
                    }
                }
            }
            _ => i64::from(vm.address_of(r)),
        },
    })
}
