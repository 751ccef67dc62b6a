use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;
use crate::scripts::Script;
use crate::sql::Delete;
use crate::sql::Insert;
use crate::sql::Select;
use crate::sql::SelectMax;
use crate::sql::Update;
use crate::types::Reply;
use crate::types::ScriptCall;
use crate::value::FieldKind;
use crate::value::FieldValue;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("script {name} failed: {message}")]
    Script { name: &'static str, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SqlError {
    #[error("duplicate primary key: {0}")]
    DuplicateKey(String),

    #[error("{0}")]
    Backend(String),
}

impl SqlError {
    #[inline]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// The remote key/value store fronting the SQL database.
///
/// Keys hold either hashes (cached rows), sets (multi-row indexes) or plain strings (advisory locks). Every cache
/// mutation goes through [`eval()`](RemoteStore::eval): the store must run the script atomically.
#[async_trait]
pub trait RemoteStore: Debug + Send + Sync + 'static {
    async fn eval(&self, script: &Script, keys: &[String], args: &[Vec<u8>]) -> Result<Reply, StoreError>;

    /// Run several scripts, returning their replies in order. Backends may pipeline.
    async fn eval_batch(&self, calls: &[ScriptCall]) -> Result<Vec<Reply>, StoreError> {
        let mut replies = Vec::with_capacity(calls.len());
        for call in calls {
            replies.push(self.eval(call.script, &call.keys, &call.args).await?);
        }
        Ok(replies)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Refresh the TTL of a key. Returns `false` if the key doesn't exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Take an advisory lock if nobody holds it. The lock vanishes by itself after `ttl`.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release a lock, but only if it is still held with the same token.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// The relational store behind the cache.
#[async_trait]
pub trait SqlStore: Debug + Send + Sync + 'static {
    /// Returns the selected rows with values in column order. `kinds` is aligned with `query.columns`. No rows is an
    /// empty vector, not an error.
    async fn select(&self, query: &Select, kinds: &[FieldKind]) -> Result<Vec<Vec<FieldValue>>, SqlError>;

    async fn select_max(&self, query: &SelectMax) -> Result<Option<i64>, SqlError>;

    /// Returns the id of the inserted row, zero when the backend doesn't report one. Must report a primary/unique key
    /// collision as [`SqlError::DuplicateKey`].
    async fn insert(&self, query: &Insert) -> Result<u64, SqlError>;

    async fn update(&self, query: &Update) -> Result<u64, SqlError>;

    async fn delete(&self, query: &Delete) -> Result<u64, SqlError>;
}

/// Event hooks for telemetry. Every method is a no-op by default.
#[async_trait]
pub trait CacheObserver: Send + Sync + 'static {
    async fn on_hit(&self, _table: &str, _key: &str) {}
    async fn on_miss(&self, _table: &str, _key: &str) {}
    async fn on_negative_hit(&self, _table: &str, _key: &str) {}
    /// A preload has written `rows` rows into the remote store.
    async fn on_load(&self, _table: &str, _key: &str, _rows: usize) {}
    /// A deferred SQL write failed and `key` was dropped from the cache. `error` is [`Error::AsyncWriteFailed`].
    async fn on_async_write_failed(&self, _key: &str, _error: &Error) {}
    async fn on_error(&self, _op: &str, _error: &Error) {}
}
