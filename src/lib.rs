//! # mr-cache
//!
//! Write-through row cache fronting a relational database with a Redis-like remote store.
//!
//! Reads are served from the remote store and fall back to SQL on a miss; writes mutate the cached row atomically and
//! are then mirrored to SQL, either inline or by a pool of background workers. Many processes may share one remote
//! store: loads and writes of a key are serialized with advisory locks kept in the store itself.
//!
//! # The Basics
//!
//! Two cache shapes are provided:
//!
//! - [`RowCache`] caches tables where the condition fields identify a single row (think `user` by `uid`). The row is a
//!   hash under a key derived from the condition values.
//! - [`RowsCache`] caches families of rows sharing the condition values and told apart by the key fields (think
//!   `user_item` by `uid`, keyed by `type`). The family is indexed by a set listing the ids of its members; each member
//!   is a hash of its own.
//!
//! A row type describes its columns through the [`Record`] trait and travels to and from the cache through serde:
//!
//! ```ignore
//! use mr_cache::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     id:   i64,
//!     uid:  i64,
//!     name: String,
//!     age:  i64,
//! }
//!
//! impl Record for User {
//!     fn fields() -> Vec<FieldDef> {
//!         vec![
//!             FieldDef::new("id", FieldKind::Int),
//!             FieldDef::new("uid", FieldKind::Int),
//!             FieldDef::new("name", FieldKind::String),
//!             FieldDef::new("age", FieldKind::Int),
//!         ]
//!     }
//!
//!     fn auto_increment() -> Option<&'static str> {
//!         Some("id")
//!     }
//! }
//!
//! let users = RowCache::<User>::new(
//!     CacheSetup::builder()
//!         .config(CacheConfig::builder().table_base_name("user").cond_fields(vec!["uid".into()]).build()?)
//!         .remote(Arc::new(MemoryStore::new()))
//!         .sql(Arc::new(SeaOrmStore::connect("sqlite://users.db", 8).await?))
//!         .build()?,
//! )?;
//!
//! let ctx = Ctx::here();
//! users.add(&ctx, &values![123], Patch::fields([("name", "alice")])).await?;
//! users.modify(&ctx, &values![123], Patch::fields([("age", 1)]), SetOptions::default()).await?;
//! let alice = users.get(&ctx, &values![123]).await?;
//! ```
//!
//! # Consistency
//!
//! - A successful write is visible to every following read of the same key, whether or not its SQL mirror has
//!   completed.
//! - Among concurrent readers missing the same key only one queries SQL; the others wait for the cache to be filled.
//! - Keys for which SQL recently returned nothing are remembered in a process-local negative registry so repeated
//!   lookups of absent rows don't hit the database.
//! - Should a deferred SQL write fail, the affected cache entries are dropped and the next read reloads what SQL holds.
//!
//! # Backends
//!
//! Remote stores implement [`RemoteStore`]; SQL stores implement [`SqlStore`]. Available implementations:
//!
//! - [`backend::MemoryStore`] and [`backend::MemorySqlStore`], in-process stores for tests and single-process use;
//! - `backend::RedisStore` with the `redis` feature;
//! - `backend::SeaOrmStore` with any of the `mysql`, `pg` or `sqlite` features.

pub mod backend;
pub(crate) mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub(crate) mod increment;
pub mod key;
pub mod lock;
pub mod negative;
pub mod patch;
pub mod row;
pub mod rows;
pub mod schema;
pub mod scripts;
pub mod sql;
pub mod traits;
pub mod types;
pub mod value;

#[doc(inline)]
pub use cache::CacheSetup;
pub use cache::CacheSetupBuilder;
#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use context::Ctx;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use row::RowCache;
#[doc(inline)]
pub use rows::RowsCache;
#[doc(inline)]
pub use schema::Record;
#[doc(inline)]
pub use traits::CacheObserver;
#[doc(inline)]
pub use traits::RemoteStore;
#[doc(inline)]
pub use traits::SqlStore;

pub mod prelude {
    pub use crate::backend::MemorySqlStore;
    pub use crate::backend::MemoryStore;
    pub use crate::cache::CacheSetup;
    pub use crate::config::CacheConfig;
    pub use crate::context::Ctx;
    pub use crate::context::OpOptions;
    pub use crate::error::Error;
    pub use crate::executor::AsyncExecutor;
    pub use crate::patch::Patch;
    pub use crate::row::RowCache;
    pub use crate::rows::RowsCache;
    pub use crate::schema::FieldDef;
    pub use crate::schema::Record;
    pub use crate::sql::Predicate;
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use crate::value::FieldKind;
    pub use crate::value::FieldValue;
    pub use crate::values;
}
