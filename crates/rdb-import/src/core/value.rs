//! Value types on both sides of the conversion engine.
//!
//! [`SourceValue`] is what an in-memory or driver row hands out before
//! conversion; [`TargetType`] and [`TargetValue`] describe what the target
//! store receives.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default precision of the target fixed decimal type.
pub const DEFAULT_DECIMAL_PRECISION: u8 = 22;
/// Default scale of the target fixed decimal type.
pub const DEFAULT_DECIMAL_SCALE: u8 = 9;
/// Largest precision accepted for a target decimal.
pub const MAX_DECIMAL_PRECISION: u8 = 35;

/// Primitive type of a target field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Text,
    Bytes,
    Date,
    Date32,
    Datetime,
    Timestamp,
    Datetime64,
    Timestamp64,
    Uuid,
}

impl TargetType {
    /// The fixed (22,9) decimal.
    pub const fn default_decimal() -> Self {
        TargetType::Decimal {
            precision: DEFAULT_DECIMAL_PRECISION,
            scale: DEFAULT_DECIMAL_SCALE,
        }
    }

    /// Parse the textual form produced by `Display`, as reported by a target
    /// store's table description.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let t = match text {
            "Bool" => TargetType::Bool,
            "Int32" => TargetType::Int32,
            "Int64" => TargetType::Int64,
            "Uint32" => TargetType::Uint32,
            "Uint64" => TargetType::Uint64,
            "Float" => TargetType::Float,
            "Double" => TargetType::Double,
            "Text" | "Utf8" => TargetType::Text,
            "Bytes" | "String" => TargetType::Bytes,
            "Date" => TargetType::Date,
            "Date32" => TargetType::Date32,
            "Datetime" => TargetType::Datetime,
            "Timestamp" => TargetType::Timestamp,
            "Datetime64" => TargetType::Datetime64,
            "Timestamp64" => TargetType::Timestamp64,
            "Uuid" => TargetType::Uuid,
            _ => {
                let inner = text.strip_prefix("Decimal(")?.strip_suffix(')')?;
                let (p, s) = inner.split_once(',')?;
                TargetType::Decimal {
                    precision: p.trim().parse().ok()?,
                    scale: s.trim().parse().ok()?,
                }
            }
        };
        Some(t)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Decimal { precision, scale } => {
                write!(f, "Decimal({},{})", precision, scale)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// One named, typed field of a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TargetType,
    pub optional: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TargetType, optional: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            optional,
        }
    }
}

/// A value ready to be written to the target store.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetValue {
    /// Absent value, with the field type it stands in for.
    Null(TargetType),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    /// Calendar date, for both `Date` and `Date32` fields.
    Date(NaiveDate),
    /// Second-precision instant, for `Datetime` and `Datetime64` fields.
    Datetime(NaiveDateTime),
    /// Microsecond-precision instant, for `Timestamp` and `Timestamp64` fields.
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
}

impl TargetValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, TargetValue::Null(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TargetValue::Int32(v) => Some(*v as i64),
            TargetValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TargetValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TargetValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TargetValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// A row in target field order.
pub type Row = Vec<TargetValue>;

/// A value as produced by a source row before conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
}

impl From<bool> for SourceValue {
    fn from(v: bool) -> Self {
        SourceValue::Bool(v)
    }
}

impl From<i32> for SourceValue {
    fn from(v: i32) -> Self {
        SourceValue::Int(v as i64)
    }
}

impl From<i64> for SourceValue {
    fn from(v: i64) -> Self {
        SourceValue::Int(v)
    }
}

impl From<f64> for SourceValue {
    fn from(v: f64) -> Self {
        SourceValue::Double(v)
    }
}

impl From<&str> for SourceValue {
    fn from(v: &str) -> Self {
        SourceValue::Text(v.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(v: String) -> Self {
        SourceValue::Text(v)
    }
}

impl From<Vec<u8>> for SourceValue {
    fn from(v: Vec<u8>) -> Self {
        SourceValue::Bytes(v)
    }
}

impl From<BigDecimal> for SourceValue {
    fn from(v: BigDecimal) -> Self {
        SourceValue::Decimal(v)
    }
}

impl From<NaiveDate> for SourceValue {
    fn from(v: NaiveDate) -> Self {
        SourceValue::Date(v)
    }
}

impl From<NaiveDateTime> for SourceValue {
    fn from(v: NaiveDateTime) -> Self {
        SourceValue::Timestamp(v)
    }
}

impl From<NaiveTime> for SourceValue {
    fn from(v: NaiveTime) -> Self {
        SourceValue::Time(v)
    }
}

impl From<Uuid> for SourceValue {
    fn from(v: Uuid) -> Self {
        SourceValue::Uuid(v)
    }
}

impl<T: Into<SourceValue>> From<Option<T>> for SourceValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SourceValue::Null)
    }
}
