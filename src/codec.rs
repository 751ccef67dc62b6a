//! Field value codec.
//!
//! Remote store representation of a field, by schema kind:
//!
//! | kind            | encoding                                   |
//! |-----------------|--------------------------------------------|
//! | bool            | `0` / `1`                                  |
//! | int, uint, float| decimal text                               |
//! | string, bytes   | raw bytes                                  |
//! | json            | JSON text                                  |
//! | time            | millisecond UNIX timestamp; epoch = absent |
//!
//! A `Null` value is never encoded: the field is deleted from the hash instead.
//!
//! Records are mapped to and from the schema's field vector through `serde_json`, with tags as object keys.

use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;
use crate::schema::FieldDef;
use crate::schema::TableSchema;
use crate::value::FieldKind;
use crate::value::FieldValue;

/// Encode a value for the remote store. `None` means the field must be absent.
pub fn encode(value: &FieldValue) -> Option<Vec<u8>> {
    Some(match value {
        FieldValue::Null => return None,
        FieldValue::Bool(b) => u8::from(*b).to_string().into_bytes(),
        FieldValue::Int(i) => i.to_string().into_bytes(),
        FieldValue::UInt(u) => u.to_string().into_bytes(),
        FieldValue::Float(f) => f.to_string().into_bytes(),
        FieldValue::Str(s) => s.as_bytes().to_vec(),
        FieldValue::Bytes(b) => b.clone(),
        FieldValue::Time(t) => {
            let millis = t.timestamp_millis();
            if millis == 0 {
                return None;
            }
            millis.to_string().into_bytes()
        }
        FieldValue::Json(j) => j.to_string().into_bytes(),
    })
}

fn text<'a>(field: &FieldDef, raw: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(raw).map_err(|e| Error::mismatch(field.tag, e))
}

/// Decode a stored value of `field`. Numeric text produced by float increments is accepted for integer fields as long
/// as it has no fractional part.
pub fn decode(field: &FieldDef, raw: &[u8]) -> Result<FieldValue> {
    let bad = |what: &str| Error::mismatch(field.tag, format!("'{}' is not a valid {what}", String::from_utf8_lossy(raw)));

    Ok(match field.kind {
        FieldKind::Bool => match text(field, raw)?.trim() {
            "1" | "true" => FieldValue::Bool(true),
            "0" | "false" | "" => FieldValue::Bool(false),
            other => FieldValue::Bool(other.parse::<i64>().map_err(|_| bad("bool"))? != 0),
        },
        FieldKind::Int => {
            let s = text(field, raw)?.trim();
            match s.parse::<i64>() {
                Ok(i) => FieldValue::Int(i),
                Err(_) => FieldValue::Int(integral(s).ok_or_else(|| bad("integer"))? as i64),
            }
        }
        FieldKind::UInt => {
            let s = text(field, raw)?.trim();
            match s.parse::<u64>() {
                Ok(u) => FieldValue::UInt(u),
                Err(_) => {
                    let f = integral(s).filter(|f| *f >= 0.0).ok_or_else(|| bad("unsigned integer"))?;
                    FieldValue::UInt(f as u64)
                }
            }
        }
        FieldKind::Float => FieldValue::Float(text(field, raw)?.trim().parse().map_err(|_| bad("float"))?),
        FieldKind::String => FieldValue::Str(text(field, raw)?.to_string()),
        FieldKind::Bytes => FieldValue::Bytes(raw.to_vec()),
        FieldKind::Time => {
            let s = text(field, raw)?.trim();
            if let Ok(millis) = s.parse::<i64>() {
                FieldValue::Time(DateTime::from_timestamp_millis(millis).ok_or_else(|| bad("timestamp"))?)
            }
            else {
                FieldValue::Time(
                    DateTime::parse_from_rfc3339(s)
                        .map_err(|_| bad("timestamp"))?
                        .with_timezone(&Utc),
                )
            }
        }
        FieldKind::Json => FieldValue::Json(serde_json::from_slice(raw).map_err(|e| Error::mismatch(field.tag, e))?),
    })
}

fn integral(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|f| f.is_finite() && f.fract() == 0.0)
}

/// Decode an `HMGET` result aligned with `fields` (schema positions). Missing hash fields decode to `Null`.
pub fn decode_fields(schema: &TableSchema, fields: &[usize], raw: Vec<Option<Vec<u8>>>) -> Result<Vec<FieldValue>> {
    if raw.len() != fields.len() {
        return Err(Error::mismatch(
            schema.type_name(),
            format!("expected {} fields, the store returned {}", fields.len(), raw.len()),
        ));
    }
    fields
        .iter()
        .zip(raw)
        .map(|(&idx, raw)| match raw {
            Some(bytes) => decode(schema.field(idx), &bytes),
            None => Ok(FieldValue::Null),
        })
        .collect()
}

/// Interpret a JSON value as a value of `field`; this is how struct fields become field values.
pub fn from_json(field: &FieldDef, json: &Json) -> Result<FieldValue> {
    let wrong = || Error::InvalidType {
        field:    field.tag.to_string(),
        expected: field.kind.name().to_string(),
        got:      json_type(json).to_string(),
    };

    if json.is_null() {
        return Ok(FieldValue::Null);
    }

    Ok(match field.kind {
        FieldKind::Bool => FieldValue::Bool(json.as_bool().ok_or_else(wrong)?),
        FieldKind::Int => FieldValue::Int(json.as_i64().ok_or_else(wrong)?),
        FieldKind::UInt => FieldValue::UInt(json.as_u64().ok_or_else(wrong)?),
        FieldKind::Float => FieldValue::Float(json.as_f64().ok_or_else(wrong)?),
        FieldKind::String => match json {
            Json::String(s) => FieldValue::Str(s.clone()),
            Json::Number(n) => FieldValue::Str(n.to_string()),
            _ => return Err(wrong()),
        },
        FieldKind::Bytes => match json {
            Json::String(s) => FieldValue::Bytes(s.as_bytes().to_vec()),
            Json::Array(items) => FieldValue::Bytes(
                items
                    .iter()
                    .map(|i| i.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(wrong)?,
            ),
            _ => return Err(wrong()),
        },
        FieldKind::Time => match json {
            Json::String(s) => FieldValue::Time(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|_| wrong())?
                    .with_timezone(&Utc),
            ),
            Json::Number(n) => {
                FieldValue::Time(n.as_i64().and_then(DateTime::from_timestamp_millis).ok_or_else(wrong)?)
            }
            _ => return Err(wrong()),
        },
        FieldKind::Json => FieldValue::Json(json.clone()),
    })
}

pub(crate) fn json_type(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(n) if n.is_f64() => "float",
        Json::Number(_) => "integer",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Serialize any struct into a JSON object.
pub(crate) fn to_object<T: Serialize + ?Sized>(value: &T) -> Result<Map<String, Json>> {
    match serde_json::to_value(value) {
        Ok(Json::Object(map)) => Ok(map),
        Ok(other) => Err(Error::InvalidType {
            field:    std::any::type_name::<T>().to_string(),
            expected: "struct".to_string(),
            got:      json_type(&other).to_string(),
        }),
        Err(e) => Err(Error::InvalidType {
            field:    std::any::type_name::<T>().to_string(),
            expected: "serializable struct".to_string(),
            got:      e.to_string(),
        }),
    }
}

/// Full field vector of a record, in schema order.
pub fn record_to_values<R: Serialize>(schema: &TableSchema, record: &R) -> Result<Vec<FieldValue>> {
    let object = to_object(record)?;
    schema
        .fields()
        .iter()
        .map(|field| object.get(field.tag).map_or(Ok(FieldValue::Null), |j| from_json(field, j)))
        .collect()
}

/// Build a value of `T` from `(schema position, value)` pairs. `Null` values are left out so that `Option` fields come
/// out as `None`.
pub fn values_to<T, I>(schema: &TableSchema, values: I) -> Result<T>
where
    T: DeserializeOwned,
    I: IntoIterator<Item = (usize, FieldValue)>,
{
    let mut object = Map::new();
    for (idx, value) in values {
        if !value.is_null() {
            object.insert(schema.field(idx).tag.to_string(), value.to_json());
        }
    }
    from_object(schema, object)
}

pub(crate) fn from_object<T: DeserializeOwned>(schema: &TableSchema, object: Map<String, Json>) -> Result<T> {
    serde_json::from_value(Json::Object(object)).map_err(|e| Error::mismatch(schema.type_name(), e))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::schema::Record;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        id:      i64,
        name:    String,
        score:   Option<f64>,
        active:  bool,
        tags:    Vec<String>,
        created: Option<DateTime<Utc>>,
    }

    impl Record for Item {
        fn fields() -> Vec<FieldDef> {
            vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("score", FieldKind::Float),
                FieldDef::new("active", FieldKind::Bool),
                FieldDef::new("tags", FieldKind::Json),
                FieldDef::new("created", FieldKind::Time),
            ]
        }
    }

    #[test]
    fn scalar_encoding() {
        assert_eq!(encode(&FieldValue::Bool(true)), Some(b"1".to_vec()));
        assert_eq!(encode(&FieldValue::Int(-3)), Some(b"-3".to_vec()));
        assert_eq!(encode(&FieldValue::Null), None);
        let epoch = DateTime::from_timestamp_millis(0).unwrap();
        assert_eq!(encode(&FieldValue::Time(epoch)), None);
    }

    #[test]
    fn tolerant_decoding() {
        let int = FieldDef::new("age", FieldKind::Int);
        assert_eq!(decode(&int, b"35").unwrap(), FieldValue::Int(35));
        assert_eq!(decode(&int, b"35.0").unwrap(), FieldValue::Int(35));
        assert!(matches!(decode(&int, b"35.5"), Err(Error::EncodingMismatch { .. })));

        let flag = FieldDef::new("flag", FieldKind::Bool);
        assert_eq!(decode(&flag, b"true").unwrap(), FieldValue::Bool(true));
        assert_eq!(decode(&flag, b"0").unwrap(), FieldValue::Bool(false));
    }

    #[test]
    fn record_through_field_vector() {
        let schema = TableSchema::of::<Item>().unwrap();
        let item = Item {
            id:      7,
            name:    "seven".into(),
            score:   None,
            active:  true,
            tags:    vec!["a".into(), "b".into()],
            created: DateTime::from_timestamp_millis(1_700_000_000_123),
        };

        let values = record_to_values(&schema, &item).unwrap();
        assert_eq!(values[2], FieldValue::Null);

        let encoded: Vec<Option<Vec<u8>>> = values.iter().map(encode).collect();
        let positions: Vec<usize> = (0..schema.len()).collect();
        let decoded = decode_fields(&schema, &positions, encoded).unwrap();
        let back: Item = values_to(&schema, decoded.into_iter().enumerate()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn struct_type_mismatch() {
        let field = FieldDef::new("age", FieldKind::Int);
        let err = from_json(&field, &Json::String("old".into())).unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));

        let name = FieldDef::new("name", FieldKind::String);
        assert_eq!(from_json(&name, &serde_json::json!(3)).unwrap(), FieldValue::Str("3".into()));
    }
}
