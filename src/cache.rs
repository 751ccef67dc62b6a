//! Machinery shared by the single-row and the multi-row caches: configuration checks, SQL emission, script argument
//! encoding, locks, the negative registry and the write-through bridge.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use fieldx::fxstruct;
use tracing::debug;
use tracing::warn;
use tracing::Instrument;

use crate::codec;
use crate::config::CacheConfig;
use crate::context::Ctx;
use crate::error::Error;
use crate::error::Result;
use crate::executor::AsyncExecutor;
use crate::executor::Compensation;
use crate::executor::WriteJob;
use crate::increment::IdAllocator;
use crate::key::load_lock_key;
use crate::key::save_lock_key;
use crate::key::KeyBuilder;
use crate::key::MULTI_ROW_PREFIX;
use crate::key::SINGLE_ROW_PREFIX;
use crate::lock;
use crate::lock::LockGuard;
use crate::lock::LOCK_WAIT;
use crate::negative::NegativeCache;
use crate::patch;
use crate::patch::FieldOp;
use crate::patch::Patch;
use crate::schema::Record;
use crate::schema::TableSchema;
use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::sql::Assign;
use crate::sql::Delete;
use crate::sql::Filter;
use crate::sql::Insert;
use crate::sql::Predicate;
use crate::sql::Select;
use crate::sql::SelectMax;
use crate::sql::Update;
use crate::traits::CacheObserver;
use crate::traits::RemoteStore;
use crate::traits::SqlStore;
use crate::types::Reply;
use crate::types::WriteMode;
use crate::value::FieldKind;
use crate::value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    SingleRow,
    MultiRow,
}

/// What a write operation hands back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Returning {
    Nothing,
    /// The whole row after the write.
    Row,
    /// Only the fields the patch changed.
    Mutated,
}

/// Construction inputs of [`RowCache`](crate::row::RowCache) and [`RowsCache`](crate::rows::RowsCache).
///
/// ```ignore
/// let setup = CacheSetup::builder()
///     .config(config)
///     .remote(remote)
///     .sql(sql)
///     .build()?;
/// let users = RowCache::<User>::new(setup)?;
/// ```
#[fxstruct(
    no_new,
    builder(
        error(Error),
        post_build(check),
        doc("Builder object of [`CacheSetup`].", "", "See [`CacheSetup::builder()`] method."),
        method_doc("Collect the inputs of a cache and validate those that don't depend on the row type."),
    )
)]
pub struct CacheSetup {
    #[fieldx(builder(required))]
    config: CacheConfig,

    #[fieldx(builder(required))]
    remote: Arc<dyn RemoteStore>,

    #[fieldx(builder(required))]
    sql: Arc<dyn SqlStore>,

    /// Required when the configuration enables `write_async`.
    #[fieldx(optional)]
    executor: Arc<AsyncExecutor>,

    #[fieldx(optional)]
    observer: Arc<dyn CacheObserver>,

    /// A private negative registry instead of the process-wide one.
    #[fieldx(optional)]
    negative: NegativeCache,
}

impl CacheSetup {
    fn check(self) -> Result<Self> {
        self.config.validate(false)?;
        if self.config.write_async() && self.executor.is_none() {
            return Err(Error::config("write_async requires an executor"));
        }
        Ok(self)
    }
}

impl std::fmt::Debug for CacheSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSetup")
            .field("config", &self.config)
            .field("executor", &self.executor.is_some())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) struct CacheBase<R: Record> {
    config:    CacheConfig,
    schema:    Arc<TableSchema>,
    table:     String,
    keys:      KeyBuilder,
    all:       Vec<usize>,
    cond_idx:  Vec<usize>,
    key_idx:   Vec<usize>,
    auto_incr: Option<usize>,
    remote:    Arc<dyn RemoteStore>,
    sql:       Arc<dyn SqlStore>,
    executor:  Option<Arc<AsyncExecutor>>,
    observer:  Option<Arc<dyn CacheObserver>>,
    negative:  NegativeCache,
    ids:       Option<IdAllocator>,
    _record:   PhantomData<fn() -> R>,
}

impl<R: Record> CacheBase<R> {
    /// Resolve the configured fields against the row type.
    pub(crate) fn new(setup: CacheSetup, shape: Shape) -> Result<Self> {
        let CacheSetup {
            config,
            remote,
            sql,
            executor,
            observer,
            negative,
            ..
        } = setup;

        if shape == Shape::MultiRow {
            config.validate(true)?;
        }

        let schema = TableSchema::of::<R>()?;
        let resolve = |names: &[String], what: &str| -> Result<Vec<usize>> {
            names
                .iter()
                .map(|name| {
                    let idx = schema.position(name).ok_or_else(|| {
                        Error::config(format!("{what} field '{name}' is not a field of {}", schema.type_name()))
                    })?;
                    let kind = schema.field(idx).kind;
                    if !kind.is_base() {
                        return Err(Error::config(format!(
                            "{what} field '{name}' must be bool, integer or string, not {kind}"
                        )));
                    }
                    Ok(idx)
                })
                .collect()
        };

        let cond_idx = resolve(config.cond_fields(), "condition")?;
        let key_idx = if shape == Shape::MultiRow {
            resolve(config.key_fields(), "key")?
        }
        else {
            Vec::new()
        };

        let auto_incr = match config.auto_incr_field() {
            Some(name) => Some(schema.position(name).ok_or_else(|| {
                Error::config(format!("auto-increment field '{name}' is not a field of {}", schema.type_name()))
            })?),
            None => schema.auto_increment(),
        };
        if let Some(idx) = auto_incr {
            let field = schema.field(idx);
            if !field.kind.is_integer() {
                return Err(Error::config(format!(
                    "auto-increment field '{}' must be an integer, not {}",
                    field.tag, field.kind
                )));
            }
        }

        if let Some(p) = config
            .static_filter()
            .iter()
            .find(|p| schema.position(&p.column).is_none())
        {
            return Err(Error::config(format!(
                "static filter column '{}' is not a field of {}",
                p.column,
                schema.type_name()
            )));
        }

        let keys = KeyBuilder::new(
            &config,
            match shape {
                Shape::SingleRow => SINGLE_ROW_PREFIX,
                Shape::MultiRow => MULTI_ROW_PREFIX,
            },
        );
        let ids = auto_incr.map(|_| {
            IdAllocator::new(
                Arc::clone(&remote),
                config.table_base_name().clone(),
                config.shard_count(),
                config.shard_index(),
            )
        });

        Ok(CacheBase {
            table: config.table_name(),
            all: (0..schema.len()).collect(),
            config,
            schema,
            keys,
            cond_idx,
            key_idx,
            auto_incr,
            remote,
            sql,
            executor,
            observer,
            negative: negative.unwrap_or_else(NegativeCache::shared),
            ids,
            _record: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[inline]
    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    #[inline]
    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Positions of every schema field.
    #[inline]
    pub(crate) fn all(&self) -> &[usize] {
        &self.all
    }

    #[inline]
    pub(crate) fn cond_idx(&self) -> &[usize] {
        &self.cond_idx
    }

    #[inline]
    pub(crate) fn key_idx(&self) -> &[usize] {
        &self.key_idx
    }

    #[inline]
    pub(crate) fn tag(&self, idx: usize) -> &'static str {
        self.schema.field(idx).tag
    }

    #[inline]
    pub(crate) fn expire(&self) -> Duration {
        Duration::from_secs(self.config.expire_secs())
    }

    #[inline]
    pub(crate) fn ttl_arg(&self) -> Vec<u8> {
        self.config.expire_secs().to_string().into_bytes()
    }

    pub(crate) fn cond_values(&self, values: &[FieldValue]) -> Result<Vec<FieldValue>> {
        patch::validate_tuple(&self.schema, &self.cond_idx, values, "condition")
    }

    pub(crate) fn key_values(&self, values: &[FieldValue]) -> Result<Vec<FieldValue>> {
        patch::validate_tuple(&self.schema, &self.key_idx, values, "key")
    }

    #[inline]
    pub(crate) fn cache_key(&self, cond: &[FieldValue]) -> String {
        self.keys.cache_key(cond)
    }

    pub(crate) fn normalize(&self, patch: Patch) -> Result<Vec<FieldOp>> {
        patch.normalize(&self.schema, &self.table)
    }

    /// Validate a condition tuple and derive its key. Failures are reported like any other operation error.
    pub(crate) async fn locate(&self, ctx: &Ctx, op: &'static str, cond: &[FieldValue]) -> Result<(Vec<FieldValue>, String)> {
        match self.cond_values(cond) {
            Ok(cond) => {
                let key = self.cache_key(&cond);
                Ok((cond, key))
            }
            Err(err) => Err(self.fail(ctx, op, &self.keys.base().to_string(), err).await),
        }
    }

    /// Patch entries that may change an existing row: condition, key and auto-increment fields identify the row and are
    /// left alone.
    pub(crate) fn writable(&self, ops: &[FieldOp]) -> Vec<FieldOp> {
        ops.iter()
            .filter(|op| {
                !self.cond_idx.contains(&op.idx) && !self.key_idx.contains(&op.idx) && Some(op.idx) != self.auto_incr
            })
            .cloned()
            .collect()
    }

    pub(crate) fn field_args(&self, positions: &[usize]) -> Vec<Vec<u8>> {
        positions.iter().map(|&idx| self.tag(idx).as_bytes().to_vec()).collect()
    }

    /// `field, value` pairs of a full row; absent values are skipped.
    pub(crate) fn row_pairs(&self, row: &[FieldValue]) -> Vec<Vec<u8>> {
        let mut pairs = Vec::with_capacity(row.len() * 2);
        for (idx, value) in row.iter().enumerate() {
            if let Some(encoded) = codec::encode(value) {
                pairs.push(self.tag(idx).as_bytes().to_vec());
                pairs.push(encoded);
            }
        }
        pairs
    }

    fn increments(&self, op: &FieldOp, mode: WriteMode) -> Option<&'static str> {
        if mode != WriteMode::Modify {
            return None;
        }
        match self.schema.field(op.idx).kind {
            FieldKind::Int | FieldKind::UInt => Some("incr"),
            FieldKind::Float => Some("fincr"),
            _ => None,
        }
    }

    /// `field, op, value` triples for the modify scripts.
    pub(crate) fn op_args(&self, ops: &[FieldOp], mode: WriteMode) -> Vec<Vec<u8>> {
        let mut args = Vec::with_capacity(ops.len() * 3);
        for op in ops {
            args.push(self.tag(op.idx).as_bytes().to_vec());
            match codec::encode(&op.value) {
                None => {
                    args.push(b"del".to_vec());
                    args.push(Vec::new());
                }
                Some(encoded) => {
                    args.push(self.increments(op, mode).unwrap_or("set").as_bytes().to_vec());
                    args.push(encoded);
                }
            }
        }
        args
    }

    pub(crate) fn predicates(&self, positions: &[usize], values: &[FieldValue]) -> Vec<Predicate> {
        positions
            .iter()
            .zip(values)
            .map(|(&idx, value)| Predicate::eq(self.tag(idx), value.clone()))
            .collect()
    }

    /// Condition fields AND the static filter.
    pub(crate) fn base_filter(&self, cond: &[FieldValue]) -> Filter {
        Filter::all(self.predicates(&self.cond_idx, cond)).and(self.config.static_filter().iter().cloned())
    }

    pub(crate) fn select(&self, filter: Filter, columns: &[usize]) -> Select {
        Select {
            table: self.table.clone(),
            columns: columns.iter().map(|&idx| self.tag(idx).to_string()).collect(),
            filter,
            limit: None,
        }
    }

    pub(crate) fn update(&self, filter: Filter, ops: &[FieldOp], mode: WriteMode) -> Option<Update> {
        if ops.is_empty() {
            return None;
        }
        let assignments = ops
            .iter()
            .map(|op| {
                let assign = if !op.value.is_null() && self.increments(op, mode).is_some() {
                    Assign::Add(op.value.clone())
                }
                else {
                    Assign::Set(op.value.clone())
                };
                (self.tag(op.idx).to_string(), assign)
            })
            .collect();
        Some(Update {
            table: self.table.clone(),
            assignments,
            filter,
        })
    }

    pub(crate) async fn query(&self, ctx: &Ctx, select: &Select, columns: &[usize]) -> Result<Vec<Vec<FieldValue>>> {
        debug!("{select}");
        let kinds: Vec<FieldKind> = columns.iter().map(|&idx| self.schema.field(idx).kind).collect();
        ctx.run(self.sql.select(select, &kinds)).await
    }

    pub(crate) async fn delete(&self, ctx: &Ctx, filter: Filter) -> Result<u64> {
        let delete = Delete {
            table: self.table.clone(),
            filter,
        };
        debug!("{delete}");
        ctx.run(self.sql.delete(&delete)).await
    }

    async fn run_insert(&self, ctx: &Ctx, insert: &Insert) -> Result<u64> {
        debug!("{insert}");
        ctx.run(self.sql.insert(insert)).await
    }

    /// INSERT the condition values and the non-absent patch values. Returns the id of the new row when the table has an
    /// auto-increment field.
    pub(crate) async fn insert(&self, ctx: &Ctx, cond: &[FieldValue], ops: &[FieldOp]) -> Result<Option<i64>> {
        let mut values: Vec<(String, FieldValue)> = self
            .cond_idx
            .iter()
            .zip(cond)
            .map(|(&idx, v)| (self.tag(idx).to_string(), v.clone()))
            .collect();
        for op in ops {
            if !op.value.is_null() && !self.cond_idx.contains(&op.idx) {
                values.push((self.tag(op.idx).to_string(), op.value.clone()));
            }
        }
        let mut insert = Insert {
            table: self.table.clone(),
            values,
        };

        let (Some(auto), Some(ids)) = (self.auto_incr, &self.ids)
        else {
            let last_id = self.run_insert(ctx, &insert).await?;
            return Ok((last_id > 0).then_some(last_id as i64));
        };

        let field = self.schema.field(auto);
        if let Some(given) = insert.value_of(field.tag) {
            let given = given.as_i64();
            self.run_insert(ctx, &insert).await?;
            return Ok(given);
        }

        let id = ids.next(ctx).await?;
        let as_field = |id: i64| FieldValue::Int(id).conform(field.kind).unwrap_or(FieldValue::Int(id));
        insert.values.push((field.tag.to_string(), as_field(id)));

        match self.run_insert(ctx, &insert).await {
            Ok(_) => Ok(Some(id)),
            Err(Error::SqlStore(err)) if err.is_duplicate_key() => {
                let max = ctx
                    .run(self.sql.select_max(&SelectMax {
                        table:  self.table.clone(),
                        column: field.tag.to_string(),
                    }))
                    .await?
                    .unwrap_or(0);
                let id = ids.recovery_id(max);
                warn!("{}: allocated id is taken, retrying with {id} (max {max})", self.table);
                if let Some(last) = insert.values.last_mut() {
                    last.1 = as_field(id);
                }
                self.run_insert(ctx, &insert).await?;
                ids.reset(ctx, id).await?;
                Ok(Some(id))
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn eval(&self, ctx: &Ctx, id: ScriptId, keys: Vec<String>, args: Vec<Vec<u8>>) -> Result<Reply> {
        ctx.run(self.remote.eval(Script::get(id), &keys, &args)).await
    }

    /// Best-effort removal of cache keys.
    pub(crate) async fn drop_keys(&self, ctx: &Ctx, keys: &[String]) {
        if let Err(err) = ctx.run(self.remote.del(keys)).await {
            warn!("could not invalidate {keys:?}: {err}");
        }
    }

    pub(crate) fn decode_reply(&self, positions: &[usize], reply: Reply) -> Result<Vec<FieldValue>> {
        let raw = reply
            .into_array()?
            .into_iter()
            .map(Reply::into_data)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        codec::decode_fields(&self.schema, positions, raw)
    }

    pub(crate) fn decode_matrix(&self, positions: &[usize], reply: Reply) -> Result<Vec<Vec<FieldValue>>> {
        reply
            .into_array()?
            .into_iter()
            .map(|row| self.decode_reply(positions, row))
            .collect()
    }

    #[inline]
    pub(crate) fn record(&self, row: Vec<FieldValue>) -> Result<R> {
        codec::values_to(&self.schema, row.into_iter().enumerate())
    }

    async fn lock(&self, ctx: &Ctx, key: String) -> Result<LockGuard> {
        if !self.config.use_lock() {
            return Ok(LockGuard::noop(key));
        }
        ctx.run(lock::acquire(&self.remote, key, LOCK_WAIT)).await
    }

    pub(crate) async fn load_lock(&self, ctx: &Ctx, key: &str) -> Result<LockGuard> {
        self.lock(ctx, load_lock_key(key)).await
    }

    pub(crate) async fn save_lock(&self, ctx: &Ctx, key: &str) -> Result<LockGuard> {
        self.lock(ctx, save_lock_key(key)).await
    }

    #[inline]
    pub(crate) fn is_negative(&self, key: &str) -> bool {
        self.negative.contains(key)
    }

    #[inline]
    pub(crate) fn mark_negative(&self, key: &str) {
        self.negative.mark(key, self.config.negative_ttl());
    }

    #[inline]
    pub(crate) fn clear_negative(&self, key: &str) {
        self.negative.clear(key);
    }

    /// Mirror a cache modification in SQL, synchronously or through the executor. The save lock is released once the
    /// UPDATE has resolved; on failure the compensation drops the affected cache entries.
    pub(crate) async fn write_through(
        &self,
        ctx: &Ctx,
        key: &str,
        update: Option<Update>,
        compensation: Compensation,
        lock: LockGuard,
    ) -> Result<()> {
        let Some(update) = update
        else {
            lock.release().await;
            return Ok(());
        };

        if self.config.write_async() {
            if let Some(executor) = &self.executor {
                let job = WriteJob {
                    key: key.to_string(),
                    sql: Arc::clone(&self.sql),
                    remote: Arc::clone(&self.remote),
                    update,
                    compensation,
                    lock,
                    observer: self.observer.clone(),
                };
                match executor.submit(job) {
                    Ok(()) => return Ok(()),
                    Err(job) => {
                        debug!("executor is closed, writing {key} inline");
                        return self.write_now(ctx, key, job.update, job.compensation, job.lock).await;
                    }
                }
            }
        }

        self.write_now(ctx, key, update, compensation, lock).await
    }

    async fn write_now(
        &self,
        ctx: &Ctx,
        key: &str,
        update: Update,
        compensation: Compensation,
        lock: LockGuard,
    ) -> Result<()> {
        debug!("{update}");
        let res = ctx.run(self.sql.update(&update)).await;
        if let Err(err) = &res {
            warn!("write for {key} failed: {err}");
            compensation.apply(self.remote.as_ref()).await;
        }
        lock.release().await;
        res.map(|_| ())
    }

    pub(crate) async fn traced<T, F>(&self, ctx: &Ctx, op: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = ctx.span(op, &self.table, key);
        match fut.instrument(span.clone()).await {
            Ok(v) => Ok(v),
            Err(err) => Err(self.fail(ctx, op, key, err).instrument(span).await),
        }
    }

    async fn fail(&self, ctx: &Ctx, op: &str, key: &str, err: Error) -> Error {
        ctx.report(op, key, &err);
        if !err.is_no_data() {
            if let Some(observer) = &self.observer {
                observer.on_error(op, &err).await;
            }
        }
        err
    }

    pub(crate) async fn observe_hit(&self, key: &str) {
        debug!("hit {key}");
        if let Some(observer) = &self.observer {
            observer.on_hit(&self.table, key).await;
        }
    }

    pub(crate) async fn observe_miss(&self, key: &str) {
        debug!("miss {key}");
        if let Some(observer) = &self.observer {
            observer.on_miss(&self.table, key).await;
        }
    }

    pub(crate) async fn observe_negative(&self, key: &str) {
        debug!("negative hit {key}");
        if let Some(observer) = &self.observer {
            observer.on_negative_hit(&self.table, key).await;
        }
    }

    pub(crate) async fn observe_load(&self, key: &str, rows: usize) {
        debug!("loaded {rows} row(s) into {key}");
        if let Some(observer) = &self.observer {
            observer.on_load(&self.table, key, rows).await;
        }
    }
}
