mod common;

use std::sync::Arc;

use common::fields;
use common::Counters;
use common::Env;
use common::TestResult;
use common::User;
use mr_cache::config::CacheConfigBuilder;
use mr_cache::prelude::*;
use serde::Deserialize;
use serde::Serialize;

fn config() -> CacheConfigBuilder {
    CacheConfig::builder()
        .table_base_name("user")
        .cond_fields(vec!["uid".into()])
}

fn seed_user(env: &Env, uid: i64, name: &str, age: i64) -> Result<i64, Box<dyn std::error::Error>> {
    env.seed(
        "user",
        fields([("uid", uid.into()), ("name", name.into()), ("age", age.into())]),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_query_once() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "Tom", 30)?;
    let users = env.users(config().build()?)?;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let users = users.clone();
        tasks.push(tokio::spawn(async move { users.get(&Ctx::new(), &values![1]).await }));
    }
    for task in tasks {
        let user = task.await??.expect("user 1 exists");
        assert_eq!(user.age, Some(30));
    }

    assert_eq!(env.sql.select_count("user"), 1);
    Ok(())
}

#[tokio::test]
async fn read_through_and_hit() -> TestResult {
    let env = Env::new(&["user"]);
    let id = seed_user(&env, 7, "Ann", 25)?;
    let counters = Arc::new(Counters::default());
    let users = RowCache::<User>::new(
        env.setup(config().build()?)
            .observer(counters.clone())
            .build()?,
    )?;

    let ctx = Ctx::here();
    let first = users.get(&ctx, &values![7]).await?;
    let second = users.get(&ctx, &values![7]).await?;
    assert_eq!(first, second);
    assert_eq!(
        first,
        Some(User {
            id,
            uid: 7,
            name: Some("Ann".into()),
            age: Some(25),
            score: None,
        })
    );

    let key = users.cache_key(&values![7])?;
    assert_eq!(key, "mrr_user_7");
    let hash = env.remote.hash(&key).expect("row is cached");
    assert_eq!(hash.get("name").map(String::as_str), Some("Ann"));
    assert!(!hash.contains_key("score"));

    assert_eq!(env.sql.select_count("user"), 1);
    assert_eq!(Counters::get(&counters.misses), 1);
    assert_eq!(Counters::get(&counters.hits), 1);
    assert_eq!(Counters::get(&counters.loads), 1);
    Ok(())
}

#[tokio::test]
async fn absent_rows_are_remembered() -> TestResult {
    let env = Env::new(&["user"]);
    let counters = Arc::new(Counters::default());
    let users = RowCache::<User>::new(
        env.setup(config().build()?)
            .observer(counters.clone())
            .build()?,
    )?;

    let ctx = Ctx::here();
    assert_eq!(users.get(&ctx, &values![9]).await?, None);
    assert_eq!(users.get(&ctx, &values![9]).await?, None);
    assert!(!users.exist(&ctx, &values![9]).await?);
    assert_eq!(env.sql.select_count("user"), 1);
    assert_eq!(Counters::get(&counters.negative), 2);

    // A row added through the cache clears the marker.
    users
        .add(&ctx, &values![9], Patch::fields([("name", "late")]))
        .await?;
    let user = users.get(&ctx, &values![9]).await?.expect("row was added");
    assert_eq!(user.name.as_deref(), Some("late"));
    Ok(())
}

#[tokio::test]
async fn set_creates_missing_row() -> TestResult {
    let env = Env::new(&["user"]);
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    let patch = || Patch::fields([("name", FieldValue::from("Bob")), ("age", 20.into())]);

    let err = users
        .set(&ctx, &values![2], patch(), SetOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_no_data());

    let created = users.set_get(&ctx, &values![2], patch(), SetOptions::create()).await?;
    assert_eq!((created.id, created.uid, created.age), (1, 2, Some(20)));

    let rows = env.sql.rows("user");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uid"], FieldValue::Int(2));
    assert_eq!(rows[0]["name"], FieldValue::from("Bob"));

    let selects = env.sql.select_count("user");
    let user = users.get(&ctx, &values![2]).await?.expect("row was created");
    assert_eq!(user, created);
    assert_eq!(env.sql.select_count("user"), selects);
    Ok(())
}

#[tokio::test]
async fn modify_increments_numbers_and_replaces_strings() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "Tom", 30)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    users
        .modify(&ctx, &values![1], Patch::fields([("age", 5)]), SetOptions::default())
        .await?;
    let user = users.get(&ctx, &values![1]).await?.expect("user 1 exists");
    assert_eq!(user.age, Some(35));
    assert_eq!(env.sql.rows("user")[0]["age"], FieldValue::Int(35));

    let changed = users
        .modify_fields(
            &ctx,
            &values![1],
            Patch::fields([("age", FieldValue::from(5)), ("name", "Tim".into()), ("score", 1.5.into())]),
            SetOptions::default(),
        )
        .await?;
    assert_eq!(changed.get("age"), Some(&FieldValue::Int(40)));
    assert_eq!(changed.get("name"), Some(&FieldValue::from("Tim")));
    assert_eq!(changed.get("score"), Some(&FieldValue::Float(1.5)));
    assert!(!changed.contains_key("uid"));

    let user = users
        .modify_get(&ctx, &values![1], Patch::fields([("score", 1.0)]), SetOptions::default())
        .await?;
    assert_eq!(user.score, Some(2.5));
    assert_eq!(user.name.as_deref(), Some("Tim"));

    let row = &env.sql.rows("user")[0];
    assert_eq!(row["name"], FieldValue::from("Tim"));
    assert_eq!(row["score"], FieldValue::Float(2.5));
    Ok(())
}

#[tokio::test]
async fn modify_as_partial_struct() -> TestResult {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Visit {
        age:  i64,
        name: Option<String>,
    }

    let env = Env::new(&["user"]);
    seed_user(&env, 3, "Eve", 10)?;
    let users = env.users(config().build()?)?;

    let after = users
        .modify_as(&Ctx::here(), &values![3], &Visit { age: 2, name: None }, SetOptions::default())
        .await?;
    assert_eq!(after, Visit { age: 12, name: None });

    // The null name was a deletion.
    let user = users.get(&Ctx::here(), &values![3]).await?.expect("user 3 exists");
    assert_eq!(user.name, None);
    Ok(())
}

#[tokio::test]
async fn null_deletes_field() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 4, "Max", 44)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    let user = users
        .set_get(
            &ctx,
            &values![4],
            Patch::fields([("name", FieldValue::Null), ("age", 45.into())]),
            SetOptions::default(),
        )
        .await?;
    assert_eq!(user.name, None);
    assert_eq!(user.age, Some(45));

    let hash = env.remote.hash(&users.cache_key(&values![4])?).expect("row is cached");
    assert!(!hash.contains_key("name"));
    assert_eq!(hash.get("age").map(String::as_str), Some("45"));

    let row = &env.sql.rows("user")[0];
    assert!(!row.contains_key("name"));
    assert_eq!(row["age"], FieldValue::Int(45));
    Ok(())
}

#[tokio::test]
async fn modify_after_null_counts_from_zero() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 6, "Lee", 60)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    users
        .set(&ctx, &values![6], Patch::fields([("age", FieldValue::Null)]), SetOptions::default())
        .await?;
    let user = users
        .modify_get(&ctx, &values![6], Patch::fields([("age", 3)]), SetOptions::default())
        .await?;
    assert_eq!(user.age, Some(3));
    assert_eq!(env.sql.rows("user")[0]["age"], FieldValue::Int(3));

    users.invalidate(&ctx, &values![6]).await?;
    let user = users.get(&ctx, &values![6]).await?.expect("user 6 exists");
    assert_eq!(user.age, Some(3));
    Ok(())
}

#[tokio::test]
async fn identity_fields_are_not_rewritten() -> TestResult {
    let env = Env::new(&["user"]);
    let id = seed_user(&env, 5, "Kim", 50)?;
    let users = env.users(config().build()?)?;

    let user = users
        .set_get(
            &Ctx::here(),
            &values![5],
            Patch::fields([("uid", FieldValue::from(99)), ("id", 1000.into()), ("age", 51.into())]),
            SetOptions::default(),
        )
        .await?;
    assert_eq!((user.id, user.uid, user.age), (id, 5, Some(51)));
    assert_eq!(env.sql.rows("user")[0]["uid"], FieldValue::Int(5));
    Ok(())
}

#[tokio::test]
async fn del_drops_row_and_marks_absent() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 6, "Joe", 60)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    assert!(users.exist(&ctx, &values![6]).await?);
    let key = users.cache_key(&values![6])?;
    assert!(env.remote.contains(&key));

    assert_eq!(users.del(&ctx, &values![6]).await?, 1);
    assert!(!env.remote.contains(&key));
    assert!(env.sql.rows("user").is_empty());

    let selects = env.sql.select_count("user");
    assert_eq!(users.get(&ctx, &values![6]).await?, None);
    assert_eq!(env.sql.select_count("user"), selects);
    Ok(())
}

#[tokio::test]
async fn batched_reads_and_deletes() -> TestResult {
    let env = Env::new(&["user"]);
    for uid in 1..=3 {
        seed_user(&env, uid, &format!("u{uid}"), uid * 10)?;
    }
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    users.get(&ctx, &values![1]).await?;
    let found = users.gets(&ctx, &[values![1], values![2], values![8]]).await?;
    let names: Vec<_> = found.iter().map(|u| u.as_ref().and_then(|u| u.name.clone())).collect();
    assert_eq!(names, vec![Some("u1".to_string()), Some("u2".to_string()), None]);

    assert_eq!(users.dels(&ctx, &[values![1], values![3], values![1]]).await?, 2);
    assert_eq!(env.sql.rows("user").len(), 1);
    assert_eq!(users.get(&ctx, &values![1]).await?, None);
    assert!(users.get(&ctx, &values![2]).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn lookup_by_non_key_field() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "a", 30)?;
    seed_user(&env, 2, "b", 30)?;
    seed_user(&env, 3, "c", 31)?;
    seed_user(&env, 4, "d", 32)?;
    let users = env.users(config().build()?)?;

    let mut found = users
        .gets_by_sql_field(&Ctx::here(), "age", &values![30, 32])
        .await?;
    found.sort_by_key(|u| u.uid);
    let uids: Vec<_> = found.iter().map(|u| u.uid).collect();
    assert_eq!(uids, vec![1, 2, 4]);
    assert!(env.remote.contains("mrr_user_4"));

    let err = users
        .gets_by_sql_field(&Ctx::here(), "nickname", &values!["x"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidField { .. }));
    Ok(())
}

#[tokio::test]
async fn static_filter_hides_rows() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "young", 10)?;
    seed_user(&env, 2, "adult", 20)?;
    let users = env.users(config().static_filter(vec![Predicate::ge("age", 20)]).build()?)?;

    let ctx = Ctx::here();
    assert_eq!(users.get(&ctx, &values![1]).await?, None);
    assert!(users.get(&ctx, &values![2]).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn deferred_write_failure_drops_cached_row() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "Tom", 30)?;
    let executor = AsyncExecutor::new(2);
    let counters = Arc::new(Counters::default());
    let users = RowCache::<User>::new(
        env.setup(config().write_async(true).build()?)
            .executor(executor.clone())
            .observer(counters.clone())
            .build()?,
    )?;
    let ctx = Ctx::here();

    users
        .modify(&ctx, &values![1], Patch::fields([("age", 1)]), SetOptions::default())
        .await?;
    executor.wait_idle().await;
    assert_eq!(env.sql.rows("user")[0]["age"], FieldValue::Int(31));

    env.sql.fail_updates(true);
    let user = users
        .modify_get(&ctx, &values![1], Patch::fields([("age", 1)]), SetOptions::default())
        .await?;
    assert_eq!(user.age, Some(32));
    executor.wait_idle().await;

    assert!(!env.remote.contains(&users.cache_key(&values![1])?));
    // Reported as AsyncWriteFailed, both to the dedicated hook and as an operation error.
    assert_eq!(Counters::get(&counters.failures), 1);
    assert_eq!(Counters::get(&counters.errors), 1);

    env.sql.fail_updates(false);
    let user = users.get(&ctx, &values![1]).await?.expect("user 1 exists");
    assert_eq!(user.age, Some(31));

    executor.close().await;
    Ok(())
}

#[tokio::test]
async fn async_write_requires_executor() -> TestResult {
    let env = Env::new(&["user"]);
    let res = env.users(config().write_async(true).build()?);
    assert!(matches!(res, Err(Error::InvalidConfig(_))));
    Ok(())
}

#[tokio::test]
async fn input_errors() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "Tom", 30)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here().quiet();

    let err = users.get(&ctx, &values![1, 2]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CountMismatch {
            expected: 1,
            got: 2,
            ..
        }
    ));

    let err = users.get(&ctx, &values!["one"]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidType { .. }));

    let err = users
        .set(&ctx, &values![1], Patch::fields([("nickname", "x")]), SetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidField { .. }));
    assert!(err.is_input_error());

    let err = users
        .modify(&ctx, &values![1], Patch::fields([("age", "old")]), SetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidType { .. }));

    // Nothing reached the stores.
    assert_eq!(env.sql.select_count("user"), 0);
    assert_eq!(env.remote.evals(), 0);
    Ok(())
}

#[tokio::test]
async fn sharded_ids_stay_in_residue_class() -> TestResult {
    let env = Env::new(&["user3"]);
    let users = env.users(config().shard_count(4).shard_index(3).build()?)?;
    let ctx = Ctx::here();

    let mut ids = Vec::new();
    for uid in 1..=3 {
        ids.push(users.add(&ctx, &values![uid], Patch::fields([("age", uid)])).await?);
    }
    for id in &ids {
        let id = id.expect("auto-increment id");
        assert_eq!(id.rem_euclid(4), 3, "{id}");
    }
    assert_eq!(users.cache_key(&values![1])?, "mrr_user3_1");
    assert_eq!(env.sql.rows("user3").len(), 3);
    Ok(())
}

#[tokio::test]
async fn taken_id_is_recovered() -> TestResult {
    let env = Env::new(&["user"]);
    // Seeded behind the counter's back.
    seed_user(&env, 1, "first", 1)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    let id = users.add(&ctx, &values![2], Patch::fields([("age", 2)])).await?;
    assert_eq!(id, Some(1001));
    let next = users.add(&ctx, &values![3], Patch::fields([("age", 3)])).await?;
    assert_eq!(next, Some(1002));

    let user = users
        .add_get(&ctx, &values![4], Patch::fields([("name", "fourth")]))
        .await?;
    assert_eq!((user.id, user.name.as_deref()), (1003, Some("fourth")));
    Ok(())
}

#[tokio::test]
async fn key_layout_options() -> TestResult {
    let env = Env::new(&["user"]);
    let users = env.users(
        CacheConfig::builder()
            .table_base_name("user")
            .cond_fields(vec!["uid".into(), "name".into()])
            .hash_tag_field("uid")
            .key_prefix("app")
            .key_suffix("v2")
            .build()?,
    )?;
    assert_eq!(users.cache_key(&values![12, "x"])?, "app_user_v2_{12}_x");
    Ok(())
}

#[tokio::test]
async fn invalidate_forces_reload() -> TestResult {
    let env = Env::new(&["user"]);
    seed_user(&env, 1, "Tom", 30)?;
    let users = env.users(config().build()?)?;
    let ctx = Ctx::here();

    users.get(&ctx, &values![1]).await?;
    users.invalidate(&ctx, &values![1]).await?;
    users.get(&ctx, &values![1]).await?;
    assert_eq!(env.sql.select_count("user"), 2);
    Ok(())
}
