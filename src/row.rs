//! Single-row cache: one row per condition tuple, cached as one hash.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::CacheBase;
use crate::cache::CacheSetup;
use crate::cache::Returning;
use crate::cache::Shape;
use crate::codec;
use crate::config::CacheConfig;
use crate::context::Ctx;
use crate::error::Error;
use crate::error::Result;
use crate::executor::Compensation;
use crate::patch::FieldOp;
use crate::patch::Patch;
use crate::schema::Record;
use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::sql::Filter;
use crate::sql::Predicate;
use crate::types::Fields;
use crate::types::Reply;
use crate::types::ScriptCall;
use crate::types::SetOptions;
use crate::types::WriteMode;
use crate::value::FieldValue;

enum Loaded {
    Missing,
    Found(Vec<FieldValue>),
    /// The row didn't exist and was inserted from the write's patch.
    Created(Vec<FieldValue>),
}

/// Cache of a table where every condition tuple identifies at most one row.
///
/// ```ignore
/// let cache = RowCache::<User>::new(
///     CacheSetup::builder()
///         .config(CacheConfig::builder().table_base_name("user").cond_fields(vec!["uid".into()]).build()?)
///         .remote(remote)
///         .sql(sql)
///         .build()?,
/// )?;
///
/// let user = cache.get(&Ctx::here(), &values![123]).await?;
/// cache.modify(&Ctx::here(), &values![123], Patch::fields([("visits", 1)]), SetOptions::default()).await?;
/// ```
pub struct RowCache<R: Record> {
    base: Arc<CacheBase<R>>,
}

impl<R: Record> Clone for RowCache<R> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
        }
    }
}

impl<R: Record> RowCache<R> {
    pub fn new(setup: CacheSetup) -> Result<Self> {
        Ok(Self {
            base: Arc::new(CacheBase::new(setup, Shape::SingleRow)?),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        self.base.config()
    }

    /// The remote store key of a condition tuple.
    pub fn cache_key(&self, cond: &[FieldValue]) -> Result<String> {
        Ok(self.base.cache_key(&self.base.cond_values(cond)?))
    }

    /// `None` when the SQL store has no such row.
    pub async fn get(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<Option<R>> {
        let (cond, key) = self.base.locate(ctx, "get", cond).await?;
        self.base.traced(ctx, "get", &key, self.get_at(ctx, &cond, &key)).await
    }

    pub async fn exist(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<bool> {
        let (cond, key) = self.base.locate(ctx, "exist", cond).await?;
        self.base
            .traced(ctx, "exist", &key, async {
                if ctx.run(self.base.remote().expire(&key, self.base.expire())).await? {
                    return Ok(true);
                }
                Ok(!matches!(self.preload(ctx, &key, &cond, None).await?, Loaded::Missing))
            })
            .await
    }

    /// INSERT a row. Returns the allocated id if the table has an auto-increment field. The cache is populated by the
    /// next read.
    pub async fn add(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch) -> Result<Option<i64>> {
        let (cond, key) = self.base.locate(ctx, "add", cond).await?;
        self.base.traced(ctx, "add", &key, self.add_at(ctx, &cond, &key, patch)).await
    }

    /// Like [`add()`](Self::add) but reads the row back.
    pub async fn add_get(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch) -> Result<R> {
        let (cond, key) = self.base.locate(ctx, "add_get", cond).await?;
        self.base
            .traced(ctx, "add_get", &key, async {
                self.add_at(ctx, &cond, &key, patch).await?;
                self.get_at(ctx, &cond, &key).await?.ok_or(Error::NoData)
            })
            .await
    }

    /// DELETE the row and drop it from the cache. Returns the number of deleted SQL rows.
    pub async fn del(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<u64> {
        let (cond, key) = self.base.locate(ctx, "del", cond).await?;
        self.base
            .traced(ctx, "del", &key, self.del_all_at(ctx, &[cond], &[key.clone()]))
            .await
    }

    /// Overwrite fields of the row. A `Null` patch value deletes the field.
    pub async fn set(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<()> {
        self.write_op(ctx, "set", cond, patch, WriteMode::Set, opts, Returning::Nothing)
            .await
            .map(|_| ())
    }

    pub async fn set_get(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<R> {
        let row = self
            .write_op(ctx, "set_get", cond, patch, WriteMode::Set, opts, Returning::Row)
            .await?;
        self.base.record(row.into_iter().map(|(_, v)| v).collect())
    }

    /// Add numeric patch values to the stored ones; other values replace.
    pub async fn modify(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<()> {
        self.write_op(ctx, "modify", cond, patch, WriteMode::Modify, opts, Returning::Nothing)
            .await
            .map(|_| ())
    }

    pub async fn modify_get(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<R> {
        let row = self
            .write_op(ctx, "modify_get", cond, patch, WriteMode::Modify, opts, Returning::Row)
            .await?;
        self.base.record(row.into_iter().map(|(_, v)| v).collect())
    }

    /// Modify and return the new values of the changed fields only.
    pub async fn modify_fields(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<Fields> {
        let values = self
            .write_op(ctx, "modify_fields", cond, patch, WriteMode::Modify, opts, Returning::Mutated)
            .await?;
        Ok(values
            .into_iter()
            .map(|(idx, v)| (self.base.tag(idx).to_string(), v))
            .collect())
    }

    /// Modify with a partial struct and get the same struct back, its changed fields holding their new values.
    pub async fn modify_as<P>(&self, ctx: &Ctx, cond: &[FieldValue], patch: &P, opts: SetOptions) -> Result<P>
    where
        P: Serialize + DeserializeOwned,
    {
        let mut object = codec::to_object(patch)?;
        let values = self
            .write_op(
                ctx,
                "modify_as",
                cond,
                Patch::Record(object.clone()),
                WriteMode::Modify,
                opts,
                Returning::Mutated,
            )
            .await?;
        for (idx, value) in values {
            object.insert(self.base.tag(idx).to_string(), value.to_json());
        }
        codec::from_object(self.base.schema(), object)
    }

    /// Batched [`get()`](Self::get); results are aligned with `conds`.
    pub async fn gets(&self, ctx: &Ctx, conds: &[Vec<FieldValue>]) -> Result<Vec<Option<R>>> {
        let (conds, keys) = self.locate_all(ctx, "gets", conds).await?;
        self.base
            .traced(ctx, "gets", &keys.join(","), self.gets_at(ctx, &conds, &keys))
            .await
    }

    /// Batched [`del()`](Self::del) issuing a single DELETE.
    pub async fn dels(&self, ctx: &Ctx, conds: &[Vec<FieldValue>]) -> Result<u64> {
        let (conds, keys) = self.locate_all(ctx, "dels", conds).await?;
        self.base
            .traced(ctx, "dels", &keys.join(","), self.del_all_at(ctx, &conds, &keys))
            .await
    }

    /// Rows whose `field` equals any of `values`, served from the cache. The SQL store is only asked for the
    /// condition tuples of the matching rows.
    pub async fn gets_by_sql_field(&self, ctx: &Ctx, field: &str, values: &[FieldValue]) -> Result<Vec<R>> {
        let key = format!("{}:{field}", self.base.table());
        self.base
            .traced(ctx, "gets_by_sql_field", &key, async {
                let schema = self.base.schema();
                let idx = schema.position(field).ok_or_else(|| Error::InvalidField {
                    table: self.base.table().to_string(),
                    field: field.to_string(),
                })?;
                let values = crate::patch::validate_tuple(schema, &vec![idx; values.len()], values, "lookup")?;
                if values.is_empty() {
                    return Ok(Vec::new());
                }

                let filter = Filter::all(self.base.config().static_filter().clone())
                    .or_groups(values.into_iter().map(|v| vec![Predicate::eq(field, v)]).collect());
                let select = self.base.select(filter, self.base.cond_idx());
                let mut conds: Vec<Vec<FieldValue>> = Vec::new();
                for cond in self.base.query(ctx, &select, self.base.cond_idx()).await? {
                    if !conds.contains(&cond) {
                        conds.push(cond);
                    }
                }
                let keys: Vec<String> = conds.iter().map(|c| self.base.cache_key(c)).collect();
                Ok(self.gets_at(ctx, &conds, &keys).await?.into_iter().flatten().collect())
            })
            .await
    }

    /// Drop the cached row without touching SQL.
    pub async fn invalidate(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<()> {
        let (_, key) = self.base.locate(ctx, "invalidate", cond).await?;
        self.base
            .traced(ctx, "invalidate", &key, async {
                ctx.run(self.base.remote().del(&[key.clone()])).await?;
                Ok(())
            })
            .await
    }

    async fn locate_all(
        &self,
        ctx: &Ctx,
        op: &'static str,
        conds: &[Vec<FieldValue>],
    ) -> Result<(Vec<Vec<FieldValue>>, Vec<String>)> {
        let mut located = Vec::with_capacity(conds.len());
        let mut keys = Vec::with_capacity(conds.len());
        for cond in conds {
            let (cond, key) = self.base.locate(ctx, op, cond).await?;
            located.push(cond);
            keys.push(key);
        }
        Ok((located, keys))
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_op(
        &self,
        ctx: &Ctx,
        op: &'static str,
        cond: &[FieldValue],
        patch: Patch,
        mode: WriteMode,
        opts: SetOptions,
        returning: Returning,
    ) -> Result<Vec<(usize, FieldValue)>> {
        let (cond, key) = self.base.locate(ctx, op, cond).await?;
        self.base
            .traced(ctx, op, &key, async {
                let ops = self.base.normalize(patch)?;
                self.write_at(ctx, &cond, &key, ops, mode, opts, returning).await
            })
            .await
    }

    fn get_args(&self) -> Vec<Vec<u8>> {
        let mut args = vec![self.base.ttl_arg()];
        args.extend(self.base.field_args(self.base.all()));
        args
    }

    /// Read the full row from the cache. A row that can't be decoded is dropped from the cache.
    async fn fetch(&self, ctx: &Ctx, key: &str) -> Result<Option<Vec<FieldValue>>> {
        let reply = self
            .base
            .eval(ctx, ScriptId::RowGet, vec![key.to_string()], self.get_args())
            .await?;
        self.decode_row(ctx, key, reply).await
    }

    async fn decode_row(&self, ctx: &Ctx, key: &str, reply: Reply) -> Result<Option<Vec<FieldValue>>> {
        if reply.is_nil() {
            return Ok(None);
        }
        match self.base.decode_reply(self.base.all(), reply) {
            Ok(row) => Ok(Some(row)),
            Err(err) => {
                self.base.drop_keys(ctx, &[key.to_string()]).await;
                Err(err)
            }
        }
    }

    async fn to_record(&self, ctx: &Ctx, key: &str, row: Vec<FieldValue>) -> Result<R> {
        match self.base.record(row) {
            Ok(record) => Ok(record),
            Err(err) => {
                self.base.drop_keys(ctx, &[key.to_string()]).await;
                Err(err)
            }
        }
    }

    /// Load the row from SQL into the cache under the load lock. With `create` set a missing row is inserted first.
    async fn preload(&self, ctx: &Ctx, key: &str, cond: &[FieldValue], create: Option<&[FieldOp]>) -> Result<Loaded> {
        let base = &self.base;
        if create.is_none() && base.is_negative(key) {
            base.observe_negative(key).await;
            return Ok(Loaded::Missing);
        }

        let lock = base.load_lock(ctx, key).await?;
        if let Some(row) = self.fetch(ctx, key).await? {
            lock.release().await;
            return Ok(Loaded::Found(row));
        }

        let select = base.select(base.base_filter(cond), base.all());
        let mut rows = base.query(ctx, &select, base.all()).await?;
        let mut created = false;

        if rows.is_empty() {
            let Some(ops) = create
            else {
                base.mark_negative(key);
                lock.release().await;
                return Ok(Loaded::Missing);
            };
            base.insert(ctx, cond, ops).await?;
            base.clear_negative(key);
            // Cache exactly what SQL holds, database defaults included.
            rows = base.query(ctx, &select, base.all()).await?;
            if rows.is_empty() {
                lock.release().await;
                return Ok(Loaded::Missing);
            }
            created = true;
        }

        let row = rows.swap_remove(0);
        let mut args = vec![base.ttl_arg()];
        args.extend(base.row_pairs(&row));
        base.eval(ctx, ScriptId::RowAdd, vec![key.to_string()], args).await?;
        lock.release().await;
        base.observe_load(key, 1).await;

        Ok(if created { Loaded::Created(row) } else { Loaded::Found(row) })
    }

    async fn get_at(&self, ctx: &Ctx, cond: &[FieldValue], key: &str) -> Result<Option<R>> {
        let row = match self.fetch(ctx, key).await? {
            Some(row) => {
                self.base.observe_hit(key).await;
                row
            }
            None => {
                self.base.observe_miss(key).await;
                match self.preload(ctx, key, cond, None).await? {
                    Loaded::Missing => return Ok(None),
                    Loaded::Found(row) | Loaded::Created(row) => row,
                }
            }
        };
        self.to_record(ctx, key, row).await.map(Some)
    }

    async fn add_at(&self, ctx: &Ctx, cond: &[FieldValue], key: &str, patch: Patch) -> Result<Option<i64>> {
        let ops = self.base.normalize(patch)?;
        let id = self.base.insert(ctx, cond, &ops).await?;
        self.base.clear_negative(key);
        Ok(id)
    }

    async fn gets_at(&self, ctx: &Ctx, conds: &[Vec<FieldValue>], keys: &[String]) -> Result<Vec<Option<R>>> {
        let calls: Vec<ScriptCall> = keys
            .iter()
            .map(|key| ScriptCall {
                script: Script::get(ScriptId::RowGet),
                keys:   vec![key.clone()],
                args:   self.get_args(),
            })
            .collect();
        let replies = ctx.run(self.base.remote().eval_batch(&calls)).await?;

        let mut records = Vec::with_capacity(keys.len());
        for ((cond, key), reply) in conds.iter().zip(keys).zip(replies) {
            let row = match self.decode_row(ctx, key, reply).await? {
                Some(row) => {
                    self.base.observe_hit(key).await;
                    Some(row)
                }
                None => {
                    self.base.observe_miss(key).await;
                    match self.preload(ctx, key, cond, None).await? {
                        Loaded::Missing => None,
                        Loaded::Found(row) | Loaded::Created(row) => Some(row),
                    }
                }
            };
            records.push(match row {
                Some(row) => Some(self.to_record(ctx, key, row).await?),
                None => None,
            });
        }
        Ok(records)
    }

    async fn del_all_at(&self, ctx: &Ctx, conds: &[Vec<FieldValue>], keys: &[String]) -> Result<u64> {
        let mut lock_keys: Vec<&String> = keys.iter().collect();
        lock_keys.sort();
        lock_keys.dedup();

        let mut locks = Vec::with_capacity(lock_keys.len());
        for key in lock_keys {
            locks.push(self.base.save_lock(ctx, key).await?);
        }

        let filter = Filter::all(self.base.config().static_filter().clone()).or_groups(
            conds
                .iter()
                .map(|cond| self.base.predicates(self.base.cond_idx(), cond))
                .collect(),
        );
        let deleted = self.base.delete(ctx, filter).await;
        let dropped = match &deleted {
            Ok(_) => ctx.run(self.base.remote().del(keys)).await.map(|_| ()),
            Err(_) => Ok(()),
        };
        if deleted.is_ok() {
            for key in keys {
                self.base.mark_negative(key);
            }
        }
        for lock in locks {
            lock.release().await;
        }
        dropped?;
        deleted
    }

    async fn modify_script(
        &self,
        ctx: &Ctx,
        key: &str,
        ops: &[FieldOp],
        mode: WriteMode,
        returning: &[usize],
    ) -> Result<Reply> {
        let mut args = vec![self.base.ttl_arg(), ops.len().to_string().into_bytes()];
        args.extend(self.base.op_args(ops, mode));
        let script = if returning.is_empty() {
            ScriptId::RowModify
        }
        else {
            args.extend(self.base.field_args(returning));
            ScriptId::RowModifyGet
        };
        self.base.eval(ctx, script, vec![key.to_string()], args).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_at(
        &self,
        ctx: &Ctx,
        cond: &[FieldValue],
        key: &str,
        ops: Vec<FieldOp>,
        mode: WriteMode,
        opts: SetOptions,
        returning: Returning,
    ) -> Result<Vec<(usize, FieldValue)>> {
        let base = &self.base;
        let writable = base.writable(&ops);
        let positions: Vec<usize> = match returning {
            Returning::Nothing => Vec::new(),
            Returning::Row => base.all().to_vec(),
            Returning::Mutated => writable.iter().map(|op| op.idx).collect(),
        };

        let lock = base.save_lock(ctx, key).await?;
        let mut reply = self.modify_script(ctx, key, &writable, mode, &positions).await?;
        let mut created = None;

        if reply.is_nil() {
            base.observe_miss(key).await;
            match self.preload(ctx, key, cond, opts.no_exist_create.then_some(&ops[..])).await? {
                Loaded::Missing => {
                    lock.release().await;
                    return Err(Error::NoData);
                }
                // The inserted row already carries the patch.
                Loaded::Created(row) => created = Some(row),
                Loaded::Found(_) => {
                    reply = self.modify_script(ctx, key, &writable, mode, &positions).await?;
                    if reply.is_nil() {
                        lock.release().await;
                        return Err(Error::NoData);
                    }
                }
            }
        }

        if let Some(row) = created {
            lock.release().await;
            return Ok(positions.into_iter().map(|idx| (idx, row[idx].clone())).collect());
        }

        let update = base.update(base.base_filter(cond), &writable, mode);
        base.write_through(ctx, key, update, Compensation::key(key), lock).await?;

        if positions.is_empty() {
            return Ok(Vec::new());
        }
        match base.decode_reply(&positions, reply) {
            Ok(values) => Ok(positions.into_iter().zip(values).collect()),
            Err(err) => {
                base.drop_keys(ctx, &[key.to_string()]).await;
                Err(err)
            }
        }
    }
}
