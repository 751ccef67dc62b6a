use std::collections::BTreeMap;

use crate::scripts::Script;
use crate::traits::StoreError;
use crate::value::FieldValue;

/// Named field values, e.g. a partial update or the fields returned by a modify.
pub type Fields = BTreeMap<String, FieldValue>;

/// A reply of the remote store, normalised from its wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Data(Vec<u8>),
    Status(String),
    Array(Vec<Reply>),
}

impl Reply {
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn into_array(self) -> Result<Vec<Reply>, StoreError> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(StoreError::UnexpectedReply(format!("expected an array, got {other:?}"))),
        }
    }

    pub fn as_int(&self) -> Result<i64, StoreError> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Data(d) => std::str::from_utf8(d)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StoreError::UnexpectedReply(format!("expected an integer, got {self:?}"))),
            other => Err(StoreError::UnexpectedReply(format!("expected an integer, got {other:?}"))),
        }
    }

    /// Bulk data of a reply; `Nil` (a missing hash field) maps to `None`.
    pub fn into_data(self) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Self::Nil => Ok(None),
            Self::Data(d) => Ok(Some(d)),
            Self::Status(s) => Ok(Some(s.into_bytes())),
            Self::Int(i) => Ok(Some(i.to_string().into_bytes())),
            other => Err(StoreError::UnexpectedReply(format!("expected bulk data, got {other:?}"))),
        }
    }
}

/// One script invocation of a batch.
#[derive(Debug, Clone)]
pub struct ScriptCall {
    pub script: &'static Script,
    pub keys:   Vec<String>,
    pub args:   Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// INSERT the patch when the row doesn't exist yet.
    pub no_exist_create: bool,
}

impl SetOptions {
    pub fn create() -> Self {
        Self { no_exist_create: true }
    }
}

/// How patch values are applied to an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Every value replaces the stored one.
    Set,
    /// Numeric values are added to the stored ones; everything else replaces.
    Modify,
}
