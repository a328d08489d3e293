//! Marshalling signatures
//!
//! A signature is a short string of one-character type tags: the first is
//! the return tag, the rest are the argument tags in order. `"iis"` is a
//! call taking an int and a string and returning an int.
//!
//! | tag | native type              |
//! |-----|--------------------------|
//! | `i` | signed 32-bit integer    |
//! | `I` | unsigned 32-bit integer  |
//! | `f` | single-precision float   |
//! | `d` | double-precision float   |
//! | `s` | string view              |
//! | `P` | raw capability           |
//! | `O` | exported-object handle   |
//! | `C` | callback closure         |
//! | `v` | nothing (return only)    |

use std::fmt;
use std::str::FromStr;

use crate::error::{BoundaryError, BoundaryResult};

/// One marshalling type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Int,
    Uint,
    Float,
    Double,
    Str,
    Ptr,
    Object,
    Callback,
    Void,
}

impl TypeTag {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'i' => TypeTag::Int,
            'I' => TypeTag::Uint,
            'f' => TypeTag::Float,
            'd' => TypeTag::Double,
            's' => TypeTag::Str,
            'P' => TypeTag::Ptr,
            'O' => TypeTag::Object,
            'C' => TypeTag::Callback,
            'v' => TypeTag::Void,
            _ => return None,
        })
    }

    pub fn as_char(self) -> char {
        match self {
            TypeTag::Int => 'i',
            TypeTag::Uint => 'I',
            TypeTag::Float => 'f',
            TypeTag::Double => 'd',
            TypeTag::Str => 's',
            TypeTag::Ptr => 'P',
            TypeTag::Object => 'O',
            TypeTag::Callback => 'C',
            TypeTag::Void => 'v',
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.as_char())
    }
}

/// Return tag plus argument tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    ret: TypeTag,
    args: Vec<TypeTag>,
}

impl Signature {
    /// Parses a signature string.
    ///
    /// `v` may only appear in return position, and a callback can be passed
    /// in but never returned.
    pub fn parse(text: &str) -> BoundaryResult<Self> {
        let mut tags = text.chars().map(|c| {
            TypeTag::from_char(c)
                .ok_or_else(|| BoundaryError::BadSignature(format!("unknown type tag '{}' in \"{}\"", c, text)))
        });
        let ret = match tags.next() {
            Some(tag) => tag?,
            None => return Err(BoundaryError::BadSignature("empty signature".into())),
        };
        if ret == TypeTag::Callback {
            return Err(BoundaryError::BadSignature(format!(
                "callbacks cannot be returned (\"{}\")",
                text
            )));
        }
        let args = tags.collect::<BoundaryResult<Vec<_>>>()?;
        if args.contains(&TypeTag::Void) {
            return Err(BoundaryError::BadSignature(format!(
                "'v' is only valid as a return tag (\"{}\")",
                text
            )));
        }
        Ok(Signature { ret, args })
    }

    pub fn new(ret: TypeTag, args: Vec<TypeTag>) -> BoundaryResult<Self> {
        let text: String = std::iter::once(ret).chain(args).map(TypeTag::as_char).collect();
        Self::parse(&text)
    }

    pub fn ret(&self) -> TypeTag {
        self.ret
    }

    pub fn args(&self) -> &[TypeTag] {
        &self.args
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl FromStr for Signature {
    type Err = BoundaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ret.as_char())?;
        for tag in &self.args {
            write!(f, "{}", tag.as_char())?;
        }
        Ok(())
    }
}
