//! Script values
//!
//! [`Value`] is `Copy`: immediates are stored inline and everything else is
//! an [`ObjRef`] into the engine heap. A stale `ObjRef` (its slot has been
//! swept and reused) is detected through the slot generation.

use std::fmt;

use crate::builtins::Builtin;

/// Handle to a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjRef {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Obj(ObjRef),
    Builtin(Builtin),
    ExcType(ExcKind),
}

impl Value {
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

/// Built-in exception types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    BaseException,
    SystemExit,
    KeyboardInterrupt,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    AttributeError,
    IndexError,
    MemoryError,
    NameError,
    OSError,
    RuntimeError,
    SyntaxError,
    TypeError,
    ValueError,
}

impl ExcKind {
    pub const ALL: [ExcKind; 16] = [
        ExcKind::BaseException,
        ExcKind::SystemExit,
        ExcKind::KeyboardInterrupt,
        ExcKind::Exception,
        ExcKind::ArithmeticError,
        ExcKind::ZeroDivisionError,
        ExcKind::OverflowError,
        ExcKind::AttributeError,
        ExcKind::IndexError,
        ExcKind::MemoryError,
        ExcKind::NameError,
        ExcKind::OSError,
        ExcKind::RuntimeError,
        ExcKind::SyntaxError,
        ExcKind::TypeError,
        ExcKind::ValueError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExcKind::BaseException => "BaseException",
            ExcKind::SystemExit => "SystemExit",
            ExcKind::KeyboardInterrupt => "KeyboardInterrupt",
            ExcKind::Exception => "Exception",
            ExcKind::ArithmeticError => "ArithmeticError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::IndexError => "IndexError",
            ExcKind::MemoryError => "MemoryError",
            ExcKind::NameError => "NameError",
            ExcKind::OSError => "OSError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::SyntaxError => "SyntaxError",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn parent(self) -> Option<ExcKind> {
        match self {
            ExcKind::BaseException => None,
            ExcKind::SystemExit | ExcKind::KeyboardInterrupt | ExcKind::Exception => {
                Some(ExcKind::BaseException)
            }
            ExcKind::ZeroDivisionError | ExcKind::OverflowError => Some(ExcKind::ArithmeticError),
            _ => Some(ExcKind::Exception),
        }
    }

    /// `issubclass(self, other)`.
    pub fn is_a(self, other: ExcKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_hierarchy() {
        assert!(ExcKind::ZeroDivisionError.is_a(ExcKind::ArithmeticError));
        assert!(ExcKind::ZeroDivisionError.is_a(ExcKind::Exception));
        assert!(ExcKind::SystemExit.is_a(ExcKind::BaseException));
        assert!(!ExcKind::SystemExit.is_a(ExcKind::Exception));
        assert!(!ExcKind::TypeError.is_a(ExcKind::ValueError));
    }

    #[test]
    fn test_names_round_trip() {
        for kind in ExcKind::ALL {
            assert_eq!(ExcKind::from_name(kind.name()), Some(kind));
        }
    }
}
