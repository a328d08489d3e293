//! Native-side values crossing the boundary

use std::fmt;
use std::rc::Rc;

use capvm_arch::{mem, CapFault, Capability, Permissions, SObj};

use crate::callback::Callback;
use crate::signature::TypeTag;

/// A read-only view of a string in someone else's memory.
///
/// The capability is bounded to the text and has `STORE` stripped, so the
/// receiver can read what it was lent and nothing more.
#[derive(Clone)]
pub struct StrView {
    cap: Capability,
    text: Rc<str>,
}

impl StrView {
    /// Lends `text`, which lives at the address of `buffer`.
    pub fn lend(buffer: Capability, text: impl Into<Rc<str>>) -> Self {
        let text = text.into();
        let cap = buffer
            .bounded(text.len() as u32)
            .restrict(Permissions::all() - Permissions::STORE);
        StrView { cap, text }
    }

    /// Writes `text` into `buffer` and lends it.
    pub fn copy_into(buffer: Capability, text: &str) -> Result<Self, CapFault> {
        mem::write_bytes(&buffer, 0, text.as_bytes())?;
        Ok(Self::lend(buffer, text))
    }

    pub fn capability(&self) -> Capability {
        self.cap
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl PartialEq for StrView {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl fmt::Debug for StrView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrView({:?} @ {:?})", self.text, self.cap)
    }
}

/// One marshalled argument or return slot.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    Int(i32),
    Uint(u32),
    Float(f32),
    Double(f64),
    /// `None` is the null string.
    Str(Option<StrView>),
    Ptr(Capability),
    Object(SObj),
    Callback(Callback),
}

impl NativeValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            NativeValue::Void => TypeTag::Void,
            NativeValue::Int(_) => TypeTag::Int,
            NativeValue::Uint(_) => TypeTag::Uint,
            NativeValue::Float(_) => TypeTag::Float,
            NativeValue::Double(_) => TypeTag::Double,
            NativeValue::Str(_) => TypeTag::Str,
            NativeValue::Ptr(_) => TypeTag::Ptr,
            NativeValue::Object(_) => TypeTag::Object,
            NativeValue::Callback(_) => TypeTag::Callback,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            NativeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            NativeValue::Uint(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            NativeValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            NativeValue::Double(x) => Some(*x),
            _ => None,
        }
    }

    /// The string, if this is a non-null string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::Str(Some(view)) => Some(view.as_str()),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<Capability> {
        match self {
            NativeValue::Ptr(cap) => Some(*cap),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<SObj> {
        match self {
            NativeValue::Object(token) => Some(*token),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            NativeValue::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, NativeValue::Void)
    }
}

impl From<i32> for NativeValue {
    fn from(i: i32) -> Self {
        NativeValue::Int(i)
    }
}

impl From<u32> for NativeValue {
    fn from(u: u32) -> Self {
        NativeValue::Uint(u)
    }
}

impl From<f32> for NativeValue {
    fn from(x: f32) -> Self {
        NativeValue::Float(x)
    }
}

impl From<f64> for NativeValue {
    fn from(x: f64) -> Self {
        NativeValue::Double(x)
    }
}

impl From<Capability> for NativeValue {
    fn from(cap: Capability) -> Self {
        NativeValue::Ptr(cap)
    }
}

impl From<SObj> for NativeValue {
    fn from(token: SObj) -> Self {
        NativeValue::Object(token)
    }
}

impl From<StrView> for NativeValue {
    fn from(view: StrView) -> Self {
        NativeValue::Str(Some(view))
    }
}

impl From<Callback> for NativeValue {
    fn from(cb: Callback) -> Self {
        NativeValue::Callback(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvm_arch::Allocator;

    #[test]
    fn test_lent_strings_are_read_only_and_bounded() {
        let heap = Allocator::with_quota(64);
        let buffer = heap.alloc(32).unwrap();
        let view = StrView::copy_into(buffer, "hi").unwrap();
        let cap = view.capability();
        assert!(cap.is_tagged());
        assert_eq!(cap.length(), 2);
        assert!(!cap.perms().contains(Permissions::STORE));
        assert!(cap.perms().contains(Permissions::LOAD));
        assert_eq!(mem::read_bytes(&cap, 0, 2).unwrap(), b"hi");
        assert_eq!(mem::write_bytes(&cap, 0, b"x"), Err(CapFault::PermitStore));
        assert_eq!(view.as_str(), "hi");
    }

    #[test]
    fn test_tags_follow_variants() {
        assert_eq!(NativeValue::from(42).tag(), TypeTag::Int);
        assert_eq!(NativeValue::from(7u32).tag(), TypeTag::Uint);
        assert_eq!(NativeValue::from(3.5f64).tag(), TypeTag::Double);
        assert_eq!(NativeValue::Str(None).tag(), TypeTag::Str);
        assert_eq!(NativeValue::Void.as_int(), None);
        assert_eq!(NativeValue::Int(-1).as_int(), Some(-1));
    }
}
