//! Table schemas compiled once per record type.
//!
//! A record type describes its columns through [`Record::fields()`]; the compiled [`TableSchema`] is immutable and
//! shared process-wide through [`TableSchema::of()`]. Records travel to and from the schema's field vector through
//! serde, so any `Serialize + DeserializeOwned` struct whose serde names match the tags can be cached.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::value::FieldKind;

static SCHEMAS: LazyLock<RwLock<HashMap<TypeId, Arc<TableSchema>>>> = LazyLock::new(|| RwLock::new(HashMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Column name used both in SQL and as the hash field in the remote store.
    pub tag:  &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(tag: &'static str, kind: FieldKind) -> Self {
        Self { tag, kind }
    }
}

/// A row type that can be cached.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id:   i64,
///     uid:  i64,
///     name: String,
/// }
///
/// impl Record for User {
///     fn fields() -> Vec<FieldDef> {
///         vec![
///             FieldDef::new("id", FieldKind::Int),
///             FieldDef::new("uid", FieldKind::Int),
///             FieldDef::new("name", FieldKind::String),
///         ]
///     }
///
///     fn auto_increment() -> Option<&'static str> {
///         Some("id")
///     }
/// }
/// ```
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Ordered column list. The order defines the canonical column layout of SELECTs and cached rows.
    fn fields() -> Vec<FieldDef>;

    fn auto_increment() -> Option<&'static str> {
        None
    }
}

#[derive(Debug)]
pub struct TableSchema {
    type_name: &'static str,
    fields:    Vec<FieldDef>,
    positions: HashMap<&'static str, usize>,
    auto_incr: Option<usize>,
}

impl TableSchema {
    /// Returns the shared compiled schema of `R`, compiling it on first use.
    pub fn of<R: Record>() -> Result<Arc<TableSchema>> {
        let type_id = TypeId::of::<R>();
        if let Some(schema) = SCHEMAS.read().get(&type_id) {
            return Ok(Arc::clone(schema));
        }

        let schema = Arc::new(Self::compile::<R>()?);
        let mut guard = SCHEMAS.write();
        // Another thread may have compiled it while we weren't holding the lock; keep the first one.
        Ok(Arc::clone(guard.entry(type_id).or_insert(schema)))
    }

    pub fn compile<R: Record>() -> Result<Self> {
        let type_name = std::any::type_name::<R>();
        let fields = R::fields();

        if fields.is_empty() {
            return Err(Error::config(format!("record {type_name} declares no fields")));
        }

        let mut positions = HashMap::with_capacity(fields.len());
        for (idx, field) in fields.iter().enumerate() {
            if positions.insert(field.tag, idx).is_some() {
                return Err(Error::config(format!(
                    "record {type_name} declares field '{}' twice",
                    field.tag
                )));
            }
        }

        let auto_incr = R::auto_increment()
            .map(|tag| {
                positions
                    .get(tag)
                    .copied()
                    .ok_or_else(|| Error::config(format!("auto-increment field '{tag}' is not a field of {type_name}")))
            })
            .transpose()?;

        Ok(Self {
            type_name,
            fields,
            positions,
            auto_incr,
        })
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[inline]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    #[inline]
    pub fn field(&self, idx: usize) -> &FieldDef {
        &self.fields[idx]
    }

    #[inline]
    pub fn position(&self, tag: &str) -> Option<usize> {
        self.positions.get(tag).copied()
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.tag)
    }

    #[inline]
    pub fn auto_increment(&self) -> Option<usize> {
        self.auto_incr
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Dup {
        a: i64,
    }

    impl Record for Dup {
        fn fields() -> Vec<FieldDef> {
            vec![FieldDef::new("a", FieldKind::Int), FieldDef::new("a", FieldKind::Int)]
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Plain {
        id:   i64,
        name: String,
    }

    impl Record for Plain {
        fn fields() -> Vec<FieldDef> {
            vec![FieldDef::new("id", FieldKind::Int), FieldDef::new("name", FieldKind::String)]
        }

        fn auto_increment() -> Option<&'static str> {
            Some("id")
        }
    }

    #[test]
    fn duplicate_tag_rejected() {
        assert!(matches!(TableSchema::compile::<Dup>(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn registry_shares_schema() {
        let a = TableSchema::of::<Plain>().unwrap();
        let b = TableSchema::of::<Plain>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.position("name"), Some(1));
        assert_eq!(a.auto_increment(), Some(0));
    }
}
