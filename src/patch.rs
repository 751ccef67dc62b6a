use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::codec;
use crate::error::Error;
use crate::error::Result;
use crate::schema::TableSchema;
use crate::types::Fields;
use crate::value::FieldValue;

/// Input of every write operation.
///
/// Either a serialized struct whose keys must be schema tags, or a mapping of field names to values. In both forms a
/// null value requests deletion of the field from the cached row.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Record(Map<String, Json>),
    Fields(Fields),
}

impl Patch {
    pub fn from_struct<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Record(codec::to_object(value)?))
    }

    pub fn fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self::Fields(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Validate against the schema and resolve tags to field positions. The result is in schema order.
    pub(crate) fn normalize(self, schema: &TableSchema, table: &str) -> Result<Vec<FieldOp>> {
        let unknown = |tag: &str| Error::InvalidField {
            table: table.to_string(),
            field: tag.to_string(),
        };

        let mut ops = match self {
            Self::Record(object) => object
                .iter()
                .map(|(tag, json)| {
                    let idx = schema.position(tag).ok_or_else(|| unknown(tag))?;
                    Ok(FieldOp {
                        idx,
                        value: codec::from_json(schema.field(idx), json)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Self::Fields(fields) => fields
                .into_iter()
                .map(|(tag, value)| {
                    let idx = schema.position(&tag).ok_or_else(|| unknown(&tag))?;
                    let field = schema.field(idx);
                    let got = value.type_name();
                    let value = value.conform(field.kind).ok_or_else(|| Error::InvalidType {
                        field:    tag.clone(),
                        expected: field.kind.name().to_string(),
                        got:      got.to_string(),
                    })?;
                    Ok(FieldOp { idx, value })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        ops.sort_by_key(|op| op.idx);
        Ok(ops)
    }
}

impl From<Fields> for Patch {
    fn from(fields: Fields) -> Self {
        Self::Fields(fields)
    }
}

/// One normalised patch entry. A `Null` value deletes the field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldOp {
    pub idx:   usize,
    pub value: FieldValue,
}

/// Check a condition or key tuple against the field positions it addresses.
pub(crate) fn validate_tuple(
    schema: &TableSchema,
    positions: &[usize],
    values: &[FieldValue],
    what: &'static str,
) -> Result<Vec<FieldValue>> {
    if values.len() != positions.len() {
        return Err(Error::CountMismatch {
            what,
            expected: positions.len(),
            got: values.len(),
        });
    }

    positions
        .iter()
        .zip(values)
        .map(|(&idx, value)| {
            let field = schema.field(idx);
            let mismatch = || Error::InvalidType {
                field:    field.tag.to_string(),
                expected: field.kind.name().to_string(),
                got:      value.type_name().to_string(),
            };
            if value.is_null() {
                return Err(mismatch());
            }
            value.clone().conform(field.kind).ok_or_else(mismatch)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::schema::FieldDef;
    use crate::schema::Record;
    use crate::value::FieldKind;
    use crate::values;

    #[derive(Serialize, Deserialize)]
    struct Row {
        uid:  i64,
        name: String,
        age:  i64,
    }

    impl Record for Row {
        fn fields() -> Vec<FieldDef> {
            vec![
                FieldDef::new("uid", FieldKind::Int),
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("age", FieldKind::Int),
            ]
        }
    }

    #[derive(Serialize)]
    struct Partial {
        age:  Option<i64>,
        name: Option<String>,
    }

    #[test]
    fn struct_patch_nulls_become_deletes() {
        let schema = TableSchema::of::<Row>().unwrap();
        let patch = Patch::from_struct(&Partial { age: Some(3), name: None }).unwrap();
        let ops = patch.normalize(&schema, "t").unwrap();
        assert_eq!(
            ops,
            vec![
                FieldOp {
                    idx:   1,
                    value: FieldValue::Null,
                },
                FieldOp {
                    idx:   2,
                    value: FieldValue::Int(3),
                },
            ]
        );
    }

    #[test]
    fn unknown_and_mistyped_fields() {
        let schema = TableSchema::of::<Row>().unwrap();
        let err = Patch::fields([("nick", "x")]).normalize(&schema, "t").unwrap_err();
        assert!(matches!(err, Error::InvalidField { .. }));

        let err = Patch::fields([("age", "old")]).normalize(&schema, "t").unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));
    }

    #[test]
    fn tuple_validation() {
        let schema = TableSchema::of::<Row>().unwrap();
        let err = validate_tuple(&schema, &[0, 2], &values![1], "condition").unwrap_err();
        assert!(matches!(err, Error::CountMismatch { expected: 2, got: 1, .. }));

        let err = validate_tuple(&schema, &[0], &values!["a"], "condition").unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));

        assert_eq!(
            validate_tuple(&schema, &[0], &values![5u32], "condition").unwrap(),
            values![5]
        );
    }
}
