use std::cmp::Ordering;
use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Int,
    UInt,
    Float,
    String,
    Bytes,
    /// Stored as a millisecond UNIX timestamp in the remote store.
    Time,
    /// Anything composite: arrays, maps, nested structs. Stored as JSON text.
    Json,
}

impl FieldKind {
    /// Base types are the only ones allowed as condition or key fields.
    #[inline]
    pub fn is_base(self) -> bool {
        matches!(self, Self::Bool | Self::Int | Self::UInt | Self::String)
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::UInt)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Time => "time",
            Self::Json => "json",
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed field value travelling between callers, the remote store and the SQL store.
///
/// `Null` stands for an absent value: a nil pointer or `None` on the caller side, a missing hash field in the remote
/// store and `NULL` in SQL.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Time(_) => "time",
            Self::Json(_) => "json",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert the value to the representation the given kind expects, following the conversions a caller can
    /// reasonably mean: pointer-free integers of either sign, integers into floats, numbers into their decimal text for
    /// string fields, strings into bytes, and anything into JSON. `Null` conforms to every kind.
    ///
    /// Returns `None` when the value does not structurally match.
    pub fn conform(self, kind: FieldKind) -> Option<FieldValue> {
        Some(match (kind, self) {
            (_, Self::Null) => Self::Null,
            (FieldKind::Bool, v @ Self::Bool(_)) => v,
            (FieldKind::Int, v @ Self::Int(_)) => v,
            (FieldKind::Int, Self::UInt(u)) => Self::Int(i64::try_from(u).ok()?),
            (FieldKind::UInt, v @ Self::UInt(_)) => v,
            (FieldKind::UInt, Self::Int(i)) => Self::UInt(u64::try_from(i).ok()?),
            (FieldKind::Float, v @ Self::Float(_)) => v,
            (FieldKind::Float, Self::Int(i)) => Self::Float(i as f64),
            (FieldKind::Float, Self::UInt(u)) => Self::Float(u as f64),
            (FieldKind::String, v @ Self::Str(_)) => v,
            (FieldKind::String, Self::Int(i)) => Self::Str(i.to_string()),
            (FieldKind::String, Self::UInt(u)) => Self::Str(u.to_string()),
            (FieldKind::String, Self::Float(f)) => Self::Str(f.to_string()),
            (FieldKind::Bytes, v @ Self::Bytes(_)) => v,
            (FieldKind::Bytes, Self::Str(s)) => Self::Bytes(s.into_bytes()),
            (FieldKind::Time, v @ Self::Time(_)) => v,
            (FieldKind::Json, v @ Self::Json(_)) => v,
            (FieldKind::Json, other) => Self::Json(other.to_json()),
            _ => return None,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::UInt(u) => J::from(*u),
            Self::Float(f) => J::from(*f),
            Self::Str(s) => J::String(s.clone()),
            Self::Bytes(b) => J::Array(b.iter().map(|c| J::from(*c)).collect()),
            Self::Time(t) => serde_json::to_value(t).unwrap_or(J::Null),
            Self::Json(j) => j.clone(),
        }
    }
}

// Textual rendering used in cache keys; base types are written without any quoting.
impl Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Self::Time(t) => write!(f, "{}", t.timestamp_millis()),
            Self::Json(j) => write!(f, "{j}"),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => a.partial_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.partial_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.partial_cmp(b),
            (Self::Time(a), Self::Time(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Int(b)) => a.partial_cmp(b),
            (Self::UInt(a), Self::UInt(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::UInt(b)) => i128::from(*a).partial_cmp(&i128::from(*b)),
            (Self::UInt(a), Self::Int(b)) => i128::from(*a).partial_cmp(&i128::from(*b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                #[inline]
                fn from(v: $ty) -> Self {
                    Self::$variant(<$conv>::from(v))
                }
            }
        )*
    };
}

field_value_from! {
    bool => Bool as bool,
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
    String => Str as String,
    &str => Str as String,
    Vec<u8> => Bytes as Vec<u8>,
    DateTime<Utc> => Time as DateTime<Utc>,
    serde_json::Value => Json as serde_json::Value,
}

impl<T> From<Option<T>> for FieldValue
where
    T: Into<FieldValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a vector of [`FieldValue`]s from heterogeneous literals: `values![123, 9, "name"]`.
#[macro_export]
macro_rules! values {
    ($($v:expr),* $(,)?) => {
        vec![$($crate::value::FieldValue::from($v)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conform_numbers() {
        assert_eq!(FieldValue::Int(5).conform(FieldKind::UInt), Some(FieldValue::UInt(5)));
        assert_eq!(FieldValue::Int(-5).conform(FieldKind::UInt), None);
        assert_eq!(FieldValue::UInt(3).conform(FieldKind::Float), Some(FieldValue::Float(3.0)));
        assert_eq!(
            FieldValue::Int(3).conform(FieldKind::String),
            Some(FieldValue::Str("3".into()))
        );
        assert_eq!(FieldValue::Str("x".into()).conform(FieldKind::Int), None);
        assert_eq!(FieldValue::Null.conform(FieldKind::Time), Some(FieldValue::Null));
    }

    #[test]
    fn mixed_sign_ordering() {
        assert!(FieldValue::Int(-1) < FieldValue::UInt(0));
        assert!(FieldValue::UInt(20) >= FieldValue::Int(20));
        assert!(FieldValue::Float(1.5) > FieldValue::Int(1));
        assert_eq!(FieldValue::Str("a".into()).partial_cmp(&FieldValue::Int(1)), None);
    }

    #[test]
    fn key_rendering() {
        assert_eq!(FieldValue::from(true).to_string(), "true");
        assert_eq!(FieldValue::from("abc").to_string(), "abc");
        assert_eq!(FieldValue::from(-12i32).to_string(), "-12");
    }
}
