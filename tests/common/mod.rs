#![allow(dead_code)]

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Once;

use async_trait::async_trait;
use mr_cache::negative::NegativeCache;
use mr_cache::prelude::*;
use mr_cache::CacheSetupBuilder;
use serde::Deserialize;
use serde::Serialize;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id:    i64,
    pub uid:   i64,
    pub name:  Option<String>,
    pub age:   Option<i64>,
    pub score: Option<f64>,
}

impl Record for User {
    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldKind::Int),
            FieldDef::new("uid", FieldKind::Int),
            FieldDef::new("name", FieldKind::String),
            FieldDef::new("age", FieldKind::Int),
            FieldDef::new("score", FieldKind::Float),
        ]
    }

    fn auto_increment() -> Option<&'static str> {
        Some("id")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserItem {
    pub id:   i64,
    pub uid:  i64,
    #[serde(rename = "type")]
    pub kind: i64,
    pub name: Option<String>,
    pub age:  Option<i64>,
}

impl Record for UserItem {
    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldKind::Int),
            FieldDef::new("uid", FieldKind::Int),
            FieldDef::new("type", FieldKind::Int),
            FieldDef::new("name", FieldKind::String),
            FieldDef::new("age", FieldKind::Int),
        ]
    }

    fn auto_increment() -> Option<&'static str> {
        Some("id")
    }
}

pub fn fields<const N: usize>(pairs: [(&str, FieldValue); N]) -> Fields {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// A pair of in-memory stores and a private negative registry.
pub struct Env {
    pub remote:   Arc<MemoryStore>,
    pub sql:      Arc<MemorySqlStore>,
    pub negative: NegativeCache,
}

impl Env {
    pub fn new(tables: &[&str]) -> Self {
        init_tracing();
        let sql = Arc::new(MemorySqlStore::new());
        for table in tables {
            sql.create_table(table, "id");
        }
        Self {
            remote: Arc::new(MemoryStore::new()),
            sql,
            negative: NegativeCache::new(1024),
        }
    }

    /// Setup over the environment's stores; callers add what else they need.
    pub fn setup(&self, config: CacheConfig) -> CacheSetupBuilder {
        CacheSetup::builder()
            .config(config)
            .remote(self.remote.clone())
            .sql(self.sql.clone())
            .negative(self.negative.clone())
    }

    pub fn users(&self, config: CacheConfig) -> Result<RowCache<User>, Error> {
        RowCache::new(self.setup(config).build()?)
    }

    pub fn items(&self, config: CacheConfig) -> Result<RowsCache<UserItem>, Error> {
        RowsCache::new(self.setup(config).build()?)
    }

    pub fn seed(&self, table: &str, row: Fields) -> Result<i64, Box<dyn std::error::Error>> {
        Ok(self.sql.insert_row(table, row)?)
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub hits:     AtomicUsize,
    pub misses:   AtomicUsize,
    pub negative: AtomicUsize,
    pub loads:    AtomicUsize,
    pub failures: AtomicUsize,
    pub errors:   AtomicUsize,
}

#[async_trait]
impl CacheObserver for Counters {
    async fn on_hit(&self, _table: &str, _key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_miss(&self, _table: &str, _key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_negative_hit(&self, _table: &str, _key: &str) {
        self.negative.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_load(&self, _table: &str, _key: &str, _rows: usize) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_async_write_failed(&self, _key: &str, error: &Error) {
        if matches!(error, Error::AsyncWriteFailed { .. }) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_error(&self, _op: &str, _error: &Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}
