//! Store implementations.
//!
//! The in-memory stores back tests and single-process setups. Redis and the sea-orm driven databases are available
//! behind the `redis` and `mysql`/`pg`/`sqlite` features respectively.

pub mod memory;
pub mod memory_sql;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(any(feature = "mysql", feature = "pg", feature = "sqlite"))]
pub mod sea_orm;

pub use memory::MemoryStore;
pub use memory_sql::MemorySqlStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
#[cfg(any(feature = "mysql", feature = "pg", feature = "sqlite"))]
pub use self::sea_orm::SeaOrmStore;
