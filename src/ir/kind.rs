//! Value kinds and constant values shared by every IR level.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a value as seen by the compiler.
///
/// `Int` values are kept sign-extended to 64 bits in registers; `Double`
/// values travel through general registers as raw IEEE bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Int,
    Long,
    Double,
    Reference,
    Word,
    Void,
}

impl Kind {
    /// Width in bytes of a value of this kind in memory.
    pub fn width(self) -> usize {
        match self {
            Kind::Int => 4,
            Kind::Long | Kind::Double | Kind::Reference | Kind::Word => 8,
            Kind::Void => 0,
        }
    }

    pub fn is_reference(self) -> bool {
        self == Kind::Reference
    }

    /// The descriptor character for this kind (`I`, `J`, `D`, `L`, `W`, `V`).
    pub fn descriptor_char(self) -> char {
        match self {
            Kind::Int => 'I',
            Kind::Long => 'J',
            Kind::Double => 'D',
            Kind::Reference => 'L',
            Kind::Word => 'W',
            Kind::Void => 'V',
        }
    }

    /// Tag passed to allocation snippets to select the element kind.
    pub fn element_tag(self) -> i32 {
        match self {
            Kind::Int => 0,
            Kind::Long => 1,
            Kind::Double => 2,
            Kind::Reference => 3,
            Kind::Word => 4,
            Kind::Void => -1,
        }
    }

    /// The zero value of this kind, used to initialise locals.
    pub fn zero(self) -> Value {
        match self {
            Kind::Int => Value::Int(0),
            Kind::Long => Value::Long(0),
            Kind::Double => Value::Double(0.0),
            Kind::Reference => Value::Null,
            Kind::Word => Value::Word(0),
            Kind::Void => Value::Int(0),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Int => "int",
            Kind::Long => "long",
            Kind::Double => "double",
            Kind::Reference => "ref",
            Kind::Word => "word",
            Kind::Void => "void",
        };
        f.write_str(name)
    }
}

/// Opaque handle of a heap object referenced from compiled code.
///
/// The collector owns the objects; the compiler only stores handles in the
/// reference-literal area of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef(pub u64);

/// A compile-time constant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Long(i64),
    Double(f64),
    Word(u64),
    Reference(ObjectRef),
    Null,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Int,
            Value::Long(_) => Kind::Long,
            Value::Double(_) => Kind::Double,
            Value::Word(_) => Kind::Word,
            Value::Reference(_) | Value::Null => Kind::Reference,
        }
    }

    /// The 64-bit register image of this value.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Value::Int(v) => v as i64 as u64,
            Value::Long(v) => v as u64,
            Value::Double(v) => v.to_bits(),
            Value::Word(v) => v,
            Value::Reference(r) => r.0,
            Value::Null => 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.to_bits() == 0
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
            && matches!(self, Value::Null) == matches!(other, Value::Null)
            && self.to_bits() == other.to_bits()
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        matches!(self, Value::Null).hash(state);
        self.to_bits().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}L"),
            Value::Double(v) => write!(f, "{v:?}D"),
            Value::Word(v) => write!(f, "{v:#x}W"),
            Value::Reference(r) => write!(f, "@{:#x}", r.0),
            Value::Null => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(Kind::Int.width(), 4);
        assert_eq!(Kind::Double.width(), 8);
        assert_eq!(Kind::Void.width(), 0);
    }

    #[test]
    fn test_value_bits() {
        assert_eq!(Value::Int(-1).to_bits(), u64::MAX);
        assert_eq!(Value::Double(1.0).to_bits(), 0x3FF0_0000_0000_0000);
        assert!(Value::Null.is_zero());
    }

    #[test]
    fn test_null_differs_from_handle_zero() {
        assert_ne!(Value::Null, Value::Reference(ObjectRef(0)));
        assert_eq!(Value::Double(0.5), Value::Double(0.5));
    }
}
