//! Capabilities as script values
//!
//! A `cap` wraps one raw capability. Scripts can move its address around
//! and compare it, but every derivation goes through the capability's own
//! monotonic operations, so a script can lose authority and never gain it.

use std::any::Any;
use std::rc::Rc;

use capvm_arch::mem::{self, Width};
use capvm_arch::{hart, Capability, Reg, CAP_BYTES};
use capvm_engine::{BinOp, CmpOp, ExcKind, ExecResult, NativeObject, Value, Vm};

/// Register the memory accessors load the capability into.
const ACCESS_REG: Reg = Reg::A1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapObject(pub Capability);

impl CapObject {
    pub fn capability(&self) -> Capability {
        self.0
    }
}

/// Boxes `cap` as a script value.
pub fn new_cap(vm: &mut Vm, cap: Capability) -> ExecResult<Value> {
    vm.alloc_native(Rc::new(CapObject(cap)))
}

/// The capability inside a `cap` value.
pub fn cap_of(vm: &Vm, value: Value) -> Option<Capability> {
    vm.native(value)?
        .as_any()
        .downcast_ref::<CapObject>()
        .map(CapObject::capability)
}

/// Integer operand of an address operation.
fn int_operand(value: Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(i),
        Value::Bool(b) => Some(i64::from(b)),
        _ => None,
    }
}

fn arg_u32(vm: &mut Vm, args: &[Value], index: usize, method: &str) -> ExecResult<u32> {
    match args.get(index) {
        Some(v) => Ok(vm.to_int(*v)? as u32),
        None => {
            let message = format!("{}() missing argument {}", method, index + 1);
            Err(vm.new_error(ExcKind::TypeError, message))
        }
    }
}

impl CapObject {
    /// Loads through the capability with the same checks a load instruction
    /// makes; a violation traps.
    fn load(&self, offset: u32, width: Width) -> u32 {
        hart::write(ACCESS_REG, self.0);
        mem::load(ACCESS_REG, offset, width)
    }

    fn store(&self, offset: u32, width: Width, value: u32) {
        hart::write(ACCESS_REG, self.0);
        mem::store(ACCESS_REG, offset, width, value);
    }

    fn to_bytes(&self, vm: &mut Vm, args: &[Value]) -> ExecResult<Value> {
        let len = match args.first() {
            Some(v) => vm.to_int(*v)?,
            None => CAP_BYTES as i64,
        };
        if len < 0 {
            return Err(vm.new_error(ExcKind::ValueError, "negative length"));
        }
        let mut buf = vec![0u8; len as usize];
        let image = self.0.to_bytes();
        let n = image.len().min(buf.len());
        buf[..n].copy_from_slice(&image[..n]);
        vm.new_bytes(&buf)
    }
}

impl NativeObject for CapObject {
    fn type_name(&self) -> &'static str {
        "cap"
    }

    fn repr(&self) -> String {
        self.0.to_string()
    }

    fn truthy(&self) -> bool {
        self.0.is_tagged()
    }

    fn to_int(&self) -> Option<i64> {
        Some(i64::from(self.0.address()))
    }

    fn hash(&self) -> Option<i64> {
        Some(i64::from(self.0.address()))
    }

    fn binary_op(&self, vm: &mut Vm, op: BinOp, rhs: Value) -> Option<ExecResult<Value>> {
        let rhs = int_operand(rhs)?;
        let address = self.0.address();
        let derived = match op {
            BinOp::Add => self.0.offset(rhs),
            BinOp::Sub => self.0.offset(rhs.wrapping_neg()),
            BinOp::BitOr => self.0.with_address(address | rhs as u32),
            BinOp::BitXor => self.0.with_address(address ^ rhs as u32),
            BinOp::BitAnd => self.0.with_address(address & rhs as u32),
            _ => return None,
        };
        Some(new_cap(vm, derived))
    }

    fn compare(&self, vm: &Vm, op: CmpOp, rhs: Value) -> Option<bool> {
        let rhs = match int_operand(rhs) {
            Some(i) => i,
            None => i64::from(cap_of(vm, rhs)?.address()),
        };
        let lhs = i64::from(self.0.address());
        Some(match op {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::NotEq => lhs != rhs,
            CmpOp::Is | CmpOp::IsNot => return None,
        })
    }

    fn call_method(&self, vm: &mut Vm, name: &str, args: &[Value]) -> ExecResult<Value> {
        match name {
            "to_bytes" => self.to_bytes(vm, args),
            "read8" | "read32" => {
                let offset = arg_u32(vm, args, 0, name)?;
                let width = if name == "read8" { Width::Byte } else { Width::Word };
                Ok(Value::Int(i64::from(self.load(offset, width))))
            }
            "write8" | "write32" => {
                let offset = arg_u32(vm, args, 0, name)?;
                let value = arg_u32(vm, args, 1, name)?;
                let width = if name == "write8" { Width::Byte } else { Width::Word };
                self.store(offset, width, value);
                Ok(Value::None)
            }
            _ => {
                let message = format!("'cap' object has no attribute '{}'", name);
                Err(vm.new_error(ExcKind::AttributeError, message))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
