//! Variant representations.
//!
//! [`Variant`] mirrors the native tagged layout exchanged with the server:
//! a type tag plus raw payload. [`Value`] is the typed form handed to
//! subscribers. The [`codec`](crate::codec) module converts between the two.

use crate::typedefs::{Hresult, VarType};
use chrono::NaiveDateTime;
use std::fmt;

/// Native variant: a type tag and its untyped payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variant {
    pub vt: VarType,
    pub data: VariantData,
}

impl Variant {
    pub const fn new(vt: VarType, data: VariantData) -> Self {
        Self { vt, data }
    }

    /// A scalar with its little-endian payload bits.
    pub const fn bits(vt: VarType, bits: u64) -> Self {
        Self {
            vt,
            data: VariantData::Bits(bits),
        }
    }
}

/// Payload of a [`Variant`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum VariantData {
    /// No payload (`EMPTY`, `NULL`, or a null `BSTR`).
    #[default]
    Empty,
    /// The low 8 bytes of the value union, little-endian.
    Bits(u64),
    /// UTF-16 code units of a `BSTR`, without terminator.
    Bstr(Vec<u16>),
    Array(SafeArray),
}

/// Bounds of one `SAFEARRAY` dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayBound {
    pub lower: i32,
    pub count: u32,
}

/// A `SAFEARRAY` payload.
///
/// Elements are stored as variants tagged with `element_type`, except for
/// `VARIANT` arrays whose elements carry their own tags. Multi-dimensional
/// arrays keep their bounds but are never decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafeArray {
    pub element_type: VarType,
    pub dimensions: Vec<ArrayBound>,
    pub elements: Vec<Variant>,
}

impl SafeArray {
    /// A zero-based one-dimensional array.
    pub fn vector(element_type: VarType, elements: Vec<Variant>) -> Self {
        let count = u32::try_from(elements.len()).unwrap_or(u32::MAX);
        Self {
            element_type,
            dimensions: vec![ArrayBound { lower: 0, count }],
            elements,
        }
    }
}

/// Currency: a signed 64-bit integer scaled by 10 000.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(pub i64);

impl Currency {
    pub const SCALE: i64 = 10_000;

    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE.unsigned_abs();
        write!(f, "{sign}{}.{:04}", abs / scale, abs % scale)
    }
}

/// One-dimensional array value.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    /// Element type; `VARIANT` allows mixed scalar elements.
    pub element_type: VarType,
    pub elements: Vec<Value>,
}

impl ArrayValue {
    pub const fn new(element_type: VarType, elements: Vec<Value>) -> Self {
        Self {
            element_type,
            elements,
        }
    }
}

/// A typed item value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Null,
    Bool(bool),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    Currency(Currency),
    /// OLE automation date, millisecond precision.
    Date(NaiveDateTime),
    String(String),
    /// An `SCODE` carried as a value.
    Error(Hresult),
    Array(ArrayValue),
}

impl Value {
    /// The variant type this value encodes to.
    pub const fn var_type(&self) -> VarType {
        match self {
            Self::Empty => VarType::EMPTY,
            Self::Null => VarType::NULL,
            Self::Bool(_) => VarType::BOOL,
            Self::I1(_) => VarType::I1,
            Self::U1(_) => VarType::UI1,
            Self::I2(_) => VarType::I2,
            Self::U2(_) => VarType::UI2,
            Self::I4(_) => VarType::I4,
            Self::U4(_) => VarType::UI4,
            Self::I8(_) => VarType::I8,
            Self::U8(_) => VarType::UI8,
            Self::R4(_) => VarType::R4,
            Self::R8(_) => VarType::R8,
            Self::Currency(_) => VarType::CY,
            Self::Date(_) => VarType::DATE,
            Self::String(_) => VarType::BSTR,
            Self::Error(_) => VarType::ERROR,
            Self::Array(array) => array.element_type.array_of(),
        }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I1,
    u8 => U1,
    i16 => I2,
    u16 => U2,
    i32 => I4,
    u32 => U4,
    i64 => I8,
    u64 => U8,
    f32 => R4,
    f64 => R8,
    Currency => Currency,
    NaiveDateTime => Date,
    String => String,
    ArrayValue => Array,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Null => f.write_str("Null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I1(v) => write!(f, "{v}"),
            Self::U1(v) => write!(f, "{v}"),
            Self::I2(v) => write!(f, "{v}"),
            Self::U2(v) => write!(f, "{v}"),
            Self::I4(v) => write!(f, "{v}"),
            Self::U4(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::R4(v) => write!(f, "{v}"),
            Self::R8(v) => write!(f, "{v}"),
            Self::Currency(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.3f")),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::Error(v) => write!(f, "Error({v})"),
            Self::Array(array) => {
                f.write_str("[")?;
                for (index, element) in array.elements.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_currency_display() {
        assert_eq!(Currency(123_456_789).to_string(), "12345.6789");
        assert_eq!(Currency(-500_001).to_string(), "-50.0001");
        assert_eq!(Currency(5).to_string(), "0.0005");
        assert!((Currency(25_000).to_f64() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Empty.to_string(), "Empty");
        assert_eq!(Value::Null.to_string(), "Null");
        assert_eq!(Value::from(true).to_string(), "true");
        assert_eq!(Value::from(-3i16).to_string(), "-3");
        assert_eq!(Value::from("hello").to_string(), "\"hello\"");
        assert_eq!(Value::Error(Hresult::E_FAIL).to_string(), "Error(0x80004005)");
        let date = NaiveDate::from_ymd_opt(2024, 3, 15)
            .and_then(|d| d.and_hms_milli_opt(12, 34, 56, 789))
            .unwrap();
        assert_eq!(Value::from(date).to_string(), "2024-03-15 12:34:56.789");
        let array = ArrayValue::new(VarType::I4, vec![Value::I4(1), Value::I4(2)]);
        assert_eq!(Value::from(array).to_string(), "[1, 2]");
    }

    #[test]
    fn test_value_var_type() {
        assert_eq!(Value::from(1u8).var_type(), VarType::UI1);
        assert_eq!(Value::from(1.5f32).var_type(), VarType::R4);
        assert_eq!(Value::Currency(Currency(1)).var_type(), VarType::CY);
        let array = ArrayValue::new(VarType::VARIANT, vec![Value::I4(1), Value::from("x")]);
        assert_eq!(Value::from(array).var_type(), VarType::VARIANT.array_of());
    }

    #[test]
    fn test_safe_array_vector_bounds() {
        let array = SafeArray::vector(VarType::I2, vec![Variant::bits(VarType::I2, 7)]);
        assert_eq!(array.dimensions, vec![ArrayBound { lower: 0, count: 1 }]);
    }
}
