//! Relational store over a sea-orm connection.
//!
//! Statements are built with sea-query for the connection's backend, so the same cache works against MySQL, Postgres
//! and SQLite.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DbBackend;
use sea_orm::DbErr;
use sea_orm::QueryResult;
use sea_orm::SqlErr;
use sea_orm::TryGetable;
use tracing::debug;

use crate::sql::Delete;
use crate::sql::Insert;
use crate::sql::Select;
use crate::sql::SelectMax;
use crate::sql::Update;
use crate::traits::SqlError;
use crate::traits::SqlStore;
use crate::value::FieldKind;
use crate::value::FieldValue;

fn sql_error(err: DbErr) -> SqlError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => SqlError::DuplicateKey(msg),
        _ => SqlError::Backend(err.to_string()),
    }
}

fn get<T: TryGetable>(row: &QueryResult, idx: usize) -> Option<Option<T>> {
    row.try_get_by_index::<Option<T>>(idx).ok()
}

// Drivers disagree on the Rust types they decode columns into; try the likely ones in turn.
fn read(row: &QueryResult, idx: usize, kind: FieldKind) -> Result<FieldValue, SqlError> {
    let value = match kind {
        FieldKind::Bool => get::<bool>(row, idx)
            .map(FieldValue::from)
            .or_else(|| get::<i64>(row, idx).map(|v| FieldValue::from(v.map(|i| i != 0)))),
        FieldKind::Int => get::<i64>(row, idx)
            .map(FieldValue::from)
            .or_else(|| get::<i32>(row, idx).map(FieldValue::from)),
        FieldKind::UInt => get::<u64>(row, idx)
            .map(FieldValue::from)
            .or_else(|| get::<i64>(row, idx).and_then(|v| v.map(u64::try_from).transpose().ok()).map(FieldValue::from))
            .or_else(|| get::<u32>(row, idx).map(FieldValue::from)),
        FieldKind::Float => get::<f64>(row, idx)
            .map(FieldValue::from)
            .or_else(|| get::<f32>(row, idx).map(FieldValue::from)),
        FieldKind::String => get::<String>(row, idx).map(FieldValue::from),
        FieldKind::Bytes => get::<Vec<u8>>(row, idx).map(FieldValue::from),
        FieldKind::Time => get::<DateTime<Utc>>(row, idx)
            .map(FieldValue::from)
            .or_else(|| get::<NaiveDateTime>(row, idx).map(|v| FieldValue::from(v.map(|t| t.and_utc())))),
        FieldKind::Json => get::<serde_json::Value>(row, idx)
            .map(FieldValue::from)
            .or_else(|| {
                get::<String>(row, idx)
                    .and_then(|v| v.map(|s| serde_json::from_str::<serde_json::Value>(&s)).transpose().ok())
                    .map(FieldValue::from)
            }),
    };
    value.ok_or_else(|| SqlError::Backend(format!("column {idx} can't be read as {kind}")))
}

#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect with a pool of at most `max_connections`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SqlError> {
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(20))
            .sqlx_logging(false);
        let db = sea_orm::Database::connect(opts).await.map_err(sql_error)?;
        Ok(Self::new(db))
    }

    #[inline]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    #[inline]
    fn backend(&self) -> DbBackend {
        self.db.get_database_backend()
    }
}

#[async_trait]
impl SqlStore for SeaOrmStore {
    async fn select(&self, query: &Select, kinds: &[FieldKind]) -> Result<Vec<Vec<FieldValue>>, SqlError> {
        let stmt = self.backend().build(&query.to_statement());
        debug!("{stmt}");
        let rows = self.db.query_all(stmt).await.map_err(sql_error)?;
        rows.iter()
            .map(|row| {
                kinds
                    .iter()
                    .enumerate()
                    .map(|(idx, kind)| read(row, idx, *kind))
                    .collect()
            })
            .collect()
    }

    async fn select_max(&self, query: &SelectMax) -> Result<Option<i64>, SqlError> {
        let stmt = self.backend().build(&query.to_statement());
        let Some(row) = self.db.query_one(stmt).await.map_err(sql_error)?
        else {
            return Ok(None);
        };
        match read(&row, 0, FieldKind::Int)? {
            FieldValue::Int(max) => Ok(Some(max)),
            _ => Ok(None),
        }
    }

    async fn insert(&self, query: &Insert) -> Result<u64, SqlError> {
        let stmt = self.backend().build(&query.to_statement()?);
        let res = self.db.execute(stmt).await.map_err(sql_error)?;
        // Postgres has no connection-level last insert id.
        Ok(match self.backend() {
            DbBackend::Postgres => 0,
            _ => res.last_insert_id(),
        })
    }

    async fn update(&self, query: &Update) -> Result<u64, SqlError> {
        let stmt = self.backend().build(&query.to_statement());
        Ok(self.db.execute(stmt).await.map_err(sql_error)?.rows_affected())
    }

    async fn delete(&self, query: &Delete) -> Result<u64, SqlError> {
        let stmt = self.backend().build(&query.to_statement());
        Ok(self.db.execute(stmt).await.map_err(sql_error)?.rows_affected())
    }
}
