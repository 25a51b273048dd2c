//! Primitive type tags and scalar values carried by columns.

use std::fmt;

use serde::{Deserialize, Serialize};

use basalt_common::{EngineError, Result};

/// Kind of opaque per-row object held by an object column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// HyperLogLog cardinality sketch.
    Hll,
    /// Exact 64-bit roaring bitmap.
    Bitmap,
}

/// Closed enumeration of the primitive types the execution core understands.
///
/// Fixed-width types expose their byte width; `Varchar` and `Object` are
/// variable-length. Dispatch tables across the engine (aggregate resolver,
/// key adaptors, serializers) are keyed by this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    /// 1-byte boolean (0/1).
    Boolean,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Signed 128-bit integer.
    Int128,
    /// IEEE 754 single.
    Float32,
    /// IEEE 754 double.
    Float64,
    /// Days since the unix epoch, 32-bit.
    Date,
    /// Microseconds since the unix epoch, 64-bit.
    Timestamp,
    /// 128-bit scaled decimal.
    Decimal128 {
        /// Total significant digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: i8,
    },
    /// Variable-length byte string.
    Varchar,
    /// Opaque per-row aggregate object.
    Object(ObjectType),
}

impl PrimitiveType {
    /// Byte width for fixed-width types, `None` for variable-length ones.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            PrimitiveType::Boolean | PrimitiveType::Int8 => Some(1),
            PrimitiveType::Int16 => Some(2),
            PrimitiveType::Int32 | PrimitiveType::Date | PrimitiveType::Float32 => Some(4),
            PrimitiveType::Int64 | PrimitiveType::Timestamp | PrimitiveType::Float64 => Some(8),
            PrimitiveType::Int128 | PrimitiveType::Decimal128 { .. } => Some(16),
            PrimitiveType::Varchar | PrimitiveType::Object(_) => None,
        }
    }

    /// Whether values of this type are floating point.
    pub fn is_float(&self) -> bool {
        matches!(self, PrimitiveType::Float32 | PrimitiveType::Float64)
    }

    /// Whether values of this type are integral (including date/timestamp/decimal bits).
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            PrimitiveType::Int8
                | PrimitiveType::Int16
                | PrimitiveType::Int32
                | PrimitiveType::Int64
                | PrimitiveType::Int128
                | PrimitiveType::Date
                | PrimitiveType::Timestamp
                | PrimitiveType::Decimal128 { .. }
        )
    }

    /// Wire tag for chunk metadata headers.
    pub(crate) fn to_tag(self) -> [u8; 3] {
        match self {
            PrimitiveType::Boolean => [0, 0, 0],
            PrimitiveType::Int8 => [1, 0, 0],
            PrimitiveType::Int16 => [2, 0, 0],
            PrimitiveType::Int32 => [3, 0, 0],
            PrimitiveType::Int64 => [4, 0, 0],
            PrimitiveType::Int128 => [5, 0, 0],
            PrimitiveType::Float32 => [6, 0, 0],
            PrimitiveType::Float64 => [7, 0, 0],
            PrimitiveType::Date => [8, 0, 0],
            PrimitiveType::Timestamp => [9, 0, 0],
            PrimitiveType::Decimal128 { precision, scale } => [10, precision, scale as u8],
            PrimitiveType::Varchar => [11, 0, 0],
            PrimitiveType::Object(ObjectType::Hll) => [12, 0, 0],
            PrimitiveType::Object(ObjectType::Bitmap) => [13, 0, 0],
        }
    }

    /// Decode a wire tag written by [`PrimitiveType::to_tag`].
    pub(crate) fn from_tag(tag: [u8; 3]) -> Result<Self> {
        Ok(match tag[0] {
            0 => PrimitiveType::Boolean,
            1 => PrimitiveType::Int8,
            2 => PrimitiveType::Int16,
            3 => PrimitiveType::Int32,
            4 => PrimitiveType::Int64,
            5 => PrimitiveType::Int128,
            6 => PrimitiveType::Float32,
            7 => PrimitiveType::Float64,
            8 => PrimitiveType::Date,
            9 => PrimitiveType::Timestamp,
            10 => PrimitiveType::Decimal128 {
                precision: tag[1],
                scale: tag[2] as i8,
            },
            11 => PrimitiveType::Varchar,
            12 => PrimitiveType::Object(ObjectType::Hll),
            13 => PrimitiveType::Object(ObjectType::Bitmap),
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown primitive type tag: {other}"
                )))
            }
        })
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveType::Decimal128 { precision, scale } => {
                write!(f, "decimal128({precision},{scale})")
            }
            PrimitiveType::Object(ObjectType::Hll) => write!(f, "hll"),
            PrimitiveType::Object(ObjectType::Bitmap) => write!(f, "bitmap"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// One scalar value, used for literals, constant columns and row accessors.
///
/// Floats compare and hash by bit pattern so datums can key hash tables and
/// IN-filters deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 8-bit integer.
    Int8(i8),
    /// 16-bit integer.
    Int16(i16),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// 128-bit integer (also carries decimal bits).
    Int128(i128),
    /// Single-precision float.
    Float32(f32),
    /// Double-precision float.
    Float64(f64),
    /// Days since epoch.
    Date(i32),
    /// Microseconds since epoch.
    Timestamp(i64),
    /// Byte string.
    Binary(Vec<u8>),
}

impl Datum {
    /// Whether this datum is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Interpret as i128 where the value is integral.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Datum::Boolean(v) => Some(*v as i128),
            Datum::Int8(v) => Some(*v as i128),
            Datum::Int16(v) => Some(*v as i128),
            Datum::Int32(v) => Some(*v as i128),
            Datum::Int64(v) => Some(*v as i128),
            Datum::Int128(v) => Some(*v),
            Datum::Date(v) => Some(*v as i128),
            Datum::Timestamp(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Interpret as f64 where the value is numeric.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Datum::Float32(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            other => other.as_int().map(|v| v as f64),
        }
    }

    /// Byte-string view for binary datums.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Total order used by min/max and window ordering. NULL sorts first.
    pub fn order_cmp(&self, other: &Datum) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
            (Datum::Float32(a), Datum::Float32(b)) => a.total_cmp(b),
            (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(b),
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => match (a.as_float(), b.as_float()) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    _ => Ordering::Equal,
                },
            },
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int8(a), Datum::Int8(b)) => a == b,
            (Datum::Int16(a), Datum::Int16(b)) => a == b,
            (Datum::Int32(a), Datum::Int32(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Int128(a), Datum::Int128(b)) => a == b,
            (Datum::Float32(a), Datum::Float32(b)) => a.to_bits() == b.to_bits(),
            (Datum::Float64(a), Datum::Float64(b)) => a.to_bits() == b.to_bits(),
            (Datum::Date(a), Datum::Date(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            (Datum::Binary(a), Datum::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl std::hash::Hash for Datum {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Datum::Null => 0u8.hash(state),
            Datum::Boolean(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Datum::Int8(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Datum::Int16(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            Datum::Int32(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            Datum::Int64(v) => {
                5u8.hash(state);
                v.hash(state);
            }
            Datum::Int128(v) => {
                6u8.hash(state);
                v.hash(state);
            }
            Datum::Float32(v) => {
                7u8.hash(state);
                v.to_bits().hash(state);
            }
            Datum::Float64(v) => {
                8u8.hash(state);
                v.to_bits().hash(state);
            }
            Datum::Date(v) => {
                9u8.hash(state);
                v.hash(state);
            }
            Datum::Timestamp(v) => {
                10u8.hash(state);
                v.hash(state);
            }
            Datum::Binary(v) => {
                11u8.hash(state);
                v.hash(state);
            }
        }
    }
}
