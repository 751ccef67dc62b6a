#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::init_tracing;
use common::TestResult;
use common::User;
use mr_cache::backend::SeaOrmStore;
use mr_cache::negative::NegativeCache;
use mr_cache::prelude::*;
use sea_orm::ConnectionTrait;

async fn users() -> Result<(RowCache<User>, Arc<SeaOrmStore>), Box<dyn std::error::Error>> {
    init_tracing();
    // One connection: every connection to `sqlite::memory:` opens a database of its own.
    let sql = Arc::new(SeaOrmStore::connect("sqlite::memory:", 1).await?);
    sql.connection()
        .execute_unprepared(
            "CREATE TABLE user (id INTEGER PRIMARY KEY, uid INTEGER NOT NULL UNIQUE, name TEXT, age INTEGER, score REAL)",
        )
        .await?;
    let users = RowCache::new(
        CacheSetup::builder()
            .config(
                CacheConfig::builder()
                    .table_base_name("user")
                    .cond_fields(vec!["uid".into()])
                    .build()?,
            )
            .remote(Arc::new(MemoryStore::new()))
            .sql(sql.clone())
            .negative(NegativeCache::new(64))
            .build()?,
    )?;
    Ok((users, sql))
}

#[tokio::test]
async fn increments_of_null_columns_match_sql() -> TestResult {
    let (users, _sql) = users().await?;
    let ctx = Ctx::here();

    users.add(&ctx, &values![1], Patch::fields([("name", "Ann")])).await?;
    users
        .set(&ctx, &values![1], Patch::fields([("age", FieldValue::Null)]), SetOptions::default())
        .await?;
    let cached = users
        .modify_get(
            &ctx,
            &values![1],
            Patch::fields([("age", FieldValue::from(3)), ("score", FieldValue::from(1.5))]),
            SetOptions::default(),
        )
        .await?;
    assert_eq!((cached.age, cached.score), (Some(3), Some(1.5)));

    users.invalidate(&ctx, &values![1]).await?;
    let stored = users.get(&ctx, &values![1]).await?.expect("user 1 exists");
    assert_eq!(stored, cached);
    Ok(())
}
