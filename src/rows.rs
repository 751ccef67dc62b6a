//! Multi-row cache: a family of rows sharing the condition values, each identified by its key values.
//!
//! The family lives under an index key holding a set of row ids (the key values joined with `:`); every row is a hash
//! at the index key followed by `_` and the id. An index always lists the whole family as SQL saw it when the index
//! was built. A member may come without its data key; reading it counts as a miss and loads the row.

use std::collections::HashSet;
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
use crate::key::data_key;
use crate::key::key_values_str;
use crate::patch::FieldOp;
use crate::patch::Patch;
use crate::schema::Record;
use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::types::Fields;
use crate::types::Reply;
use crate::types::ScriptCall;
use crate::types::SetOptions;
use crate::types::WriteMode;
use crate::value::FieldValue;

type Row = Vec<FieldValue>;

#[derive(Clone, Copy)]
enum Target<'a> {
    All,
    /// Key value tuples of the wanted rows.
    Ids(&'a [Vec<FieldValue>]),
}

enum Loaded {
    Missing,
    Found(Vec<Row>),
    Created(Vec<Row>),
}

/// Cache of a table where a condition tuple selects many rows, told apart by the key fields.
///
/// ```ignore
/// let setup = CacheSetup::builder()
///     .config(
///         CacheConfig::builder()
///             .table_base_name("user_item")
///             .cond_fields(vec!["uid".into()])
///             .key_fields(vec!["type".into()])
///             .build()?,
///     )
///     .remote(remote)
///     .sql(sql)
///     .build()?;
/// let items = RowsCache::<UserItem>::new(setup)?;
///
/// let all = items.get_all(&Ctx::here(), &values![123]).await?;
/// let one = items.get(&Ctx::here(), &values![123], &values![8]).await?;
/// ```
pub struct RowsCache<R: Record> {
    base: Arc<CacheBase<R>>,
}

impl<R: Record> Clone for RowsCache<R> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
        }
    }
}

impl<R: Record> RowsCache<R> {
    pub fn new(setup: CacheSetup) -> Result<Self> {
        Ok(Self {
            base: Arc::new(CacheBase::new(setup, Shape::MultiRow)?),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        self.base.config()
    }

    /// The index key of a family.
    pub fn index_key(&self, cond: &[FieldValue]) -> Result<String> {
        Ok(self.base.cache_key(&self.base.cond_values(cond)?))
    }

    /// The data key of one row.
    pub fn data_key(&self, cond: &[FieldValue], key: &[FieldValue]) -> Result<String> {
        let index = self.index_key(cond)?;
        Ok(data_key(&index, &key_values_str(&self.base.key_values(key)?)))
    }

    /// Every row of the family. An empty family is an empty vector.
    pub async fn get_all(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<Vec<R>> {
        let (cond, index) = self.base.locate(ctx, "get_all", cond).await?;
        self.base
            .traced(ctx, "get_all", &index, async {
                let rows = match self.fetch_all(ctx, &index).await? {
                    Some(rows) => {
                        self.base.observe_hit(&index).await;
                        rows
                    }
                    None => {
                        self.base.observe_miss(&index).await;
                        match self.preload(ctx, &index, &cond, Target::All, None).await? {
                            Loaded::Missing => Vec::new(),
                            Loaded::Found(rows) | Loaded::Created(rows) => rows,
                        }
                    }
                };
                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    records.push(self.to_record(ctx, &index, row).await?);
                }
                Ok(records)
            })
            .await
    }

    /// The rows with the given key values, aligned with `keys`.
    pub async fn gets(&self, ctx: &Ctx, cond: &[FieldValue], keys: &[Vec<FieldValue>]) -> Result<Vec<Option<R>>> {
        let (cond, index) = self.base.locate(ctx, "gets", cond).await?;
        self.base
            .traced(ctx, "gets", &index, async {
                let keys = keys
                    .iter()
                    .map(|key| self.base.key_values(key))
                    .collect::<Result<Vec<_>>>()?;
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<String> = keys.iter().map(|key| key_values_str(key)).collect();

                let rows: Vec<Option<Row>> = match self.fetch_ids(ctx, &index, &ids).await? {
                    Some(rows) => {
                        self.base.observe_hit(&index).await;
                        rows.into_iter().map(Some).collect()
                    }
                    None => {
                        self.base.observe_miss(&index).await;
                        let loaded = match self.preload(ctx, &index, &cond, Target::Ids(&keys), None).await? {
                            Loaded::Missing => Vec::new(),
                            Loaded::Found(rows) | Loaded::Created(rows) => rows,
                        };
                        ids.iter().map(|id| self.pick(&loaded, id).cloned()).collect()
                    }
                };

                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    records.push(match row {
                        Some(row) => Some(self.to_record(ctx, &index, row).await?),
                        None => None,
                    });
                }
                Ok(records)
            })
            .await
    }

    /// `None` when the family has no row with these key values.
    pub async fn get(&self, ctx: &Ctx, cond: &[FieldValue], key: &[FieldValue]) -> Result<Option<R>> {
        let (cond, index) = self.base.locate(ctx, "get", cond).await?;
        self.base
            .traced(ctx, "get", &index, async {
                let key = self.base.key_values(key)?;
                self.get_at(ctx, &cond, &index, key).await
            })
            .await
    }

    pub async fn exist(&self, ctx: &Ctx, cond: &[FieldValue], key: &[FieldValue]) -> Result<bool> {
        let (cond, index) = self.base.locate(ctx, "exist", cond).await?;
        self.base
            .traced(ctx, "exist", &index, async {
                let key = self.base.key_values(key)?;
                let id = key_values_str(&key);
                let reply = self
                    .base
                    .eval(
                        ctx,
                        ScriptId::RowsExist,
                        vec![index.clone()],
                        vec![self.base.ttl_arg(), id.clone().into_bytes()],
                    )
                    .await?;
                if !reply.is_nil() {
                    return Ok(reply.as_int()? == 1);
                }
                self.base.observe_miss(&index).await;
                Ok(match self.preload(ctx, &index, &cond, Target::Ids(&[key]), None).await? {
                    Loaded::Missing => false,
                    Loaded::Found(rows) | Loaded::Created(rows) => self.pick(&rows, &id).is_some(),
                })
            })
            .await
    }

    /// INSERT a row; the patch must hold every key field. The family is reloaded by the next read.
    pub async fn add(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch) -> Result<Option<i64>> {
        let (cond, index) = self.base.locate(ctx, "add", cond).await?;
        self.base
            .traced(ctx, "add", &index, async {
                let ops = self.base.normalize(patch)?;
                let key = self.patch_key(&ops)?;
                self.add_at(ctx, &cond, &index, &key, &ops).await
            })
            .await
    }

    pub async fn add_get(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch) -> Result<R> {
        let (cond, index) = self.base.locate(ctx, "add_get", cond).await?;
        self.base
            .traced(ctx, "add_get", &index, async {
                let ops = self.base.normalize(patch)?;
                let key = self.patch_key(&ops)?;
                self.add_at(ctx, &cond, &index, &key, &ops).await?;
                self.get_at(ctx, &cond, &index, key).await?.ok_or(Error::NoData)
            })
            .await
    }

    /// DELETE one row of the family.
    pub async fn del(&self, ctx: &Ctx, cond: &[FieldValue], key: &[FieldValue]) -> Result<u64> {
        self.dels(ctx, cond, &[key.to_vec()]).await
    }

    /// DELETE rows of the family with a single statement and drop them from the index.
    pub async fn dels(&self, ctx: &Ctx, cond: &[FieldValue], keys: &[Vec<FieldValue>]) -> Result<u64> {
        let (cond, index) = self.base.locate(ctx, "dels", cond).await?;
        self.base
            .traced(ctx, "dels", &index, async {
                let base = &self.base;
                let keys = keys.iter().map(|key| base.key_values(key)).collect::<Result<Vec<_>>>()?;
                if keys.is_empty() {
                    return Ok(0);
                }
                let ids: Vec<String> = keys.iter().map(|key| key_values_str(key)).collect();

                let lock = base.save_lock(ctx, &index).await?;
                let filter = base
                    .base_filter(&cond)
                    .or_groups(keys.iter().map(|key| base.predicates(base.key_idx(), key)).collect());
                let deleted = base.delete(ctx, filter).await?;
                base.eval(
                    ctx,
                    ScriptId::RowsDels,
                    vec![index.clone()],
                    ids.iter().map(|id| id.clone().into_bytes()).collect(),
                )
                .await?;
                for id in &ids {
                    base.mark_negative(&data_key(&index, id));
                }
                lock.release().await;
                Ok(deleted)
            })
            .await
    }

    /// DELETE the whole family.
    pub async fn del_all(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<u64> {
        let (cond, index) = self.base.locate(ctx, "del_all", cond).await?;
        self.base
            .traced(ctx, "del_all", &index, async {
                let base = &self.base;
                let lock = base.save_lock(ctx, &index).await?;
                let deleted = base.delete(ctx, base.base_filter(&cond)).await?;
                base.eval(ctx, ScriptId::RowsDelAll, vec![index.clone()], Vec::new())
                    .await?;
                base.mark_negative(&index);
                lock.release().await;
                Ok(deleted)
            })
            .await
    }

    /// Overwrite fields of the row whose key values the patch carries.
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

    pub async fn modify_fields(&self, ctx: &Ctx, cond: &[FieldValue], patch: Patch, opts: SetOptions) -> Result<Fields> {
        let values = self
            .write_op(ctx, "modify_fields", cond, patch, WriteMode::Modify, opts, Returning::Mutated)
            .await?;
        Ok(values
            .into_iter()
            .map(|(idx, v)| (self.base.tag(idx).to_string(), v))
            .collect())
    }

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

    /// Drop the family from the cache without touching SQL. Returns the number of dropped rows.
    pub async fn invalidate(&self, ctx: &Ctx, cond: &[FieldValue]) -> Result<u64> {
        let (_, index) = self.base.locate(ctx, "invalidate", cond).await?;
        self.base
            .traced(ctx, "invalidate", &index, async {
                let reply = self
                    .base
                    .eval(ctx, ScriptId::RowsDelAll, vec![index.clone()], Vec::new())
                    .await?;
                Ok(u64::try_from(reply.as_int()?).unwrap_or(0))
            })
            .await
    }

    fn id_of(&self, row: &[FieldValue]) -> String {
        let key: Vec<FieldValue> = self.base.key_idx().iter().map(|&idx| row[idx].clone()).collect();
        key_values_str(&key)
    }

    fn pick<'a>(&self, rows: &'a [Row], id: &str) -> Option<&'a Row> {
        rows.iter().find(|row| self.id_of(row) == id)
    }

    /// Key values carried by a write patch.
    fn patch_key(&self, ops: &[FieldOp]) -> Result<Vec<FieldValue>> {
        let key_idx = self.base.key_idx();
        let values: Vec<FieldValue> = key_idx
            .iter()
            .filter_map(|idx| {
                ops.iter()
                    .find(|op| op.idx == *idx && !op.value.is_null())
                    .map(|op| op.value.clone())
            })
            .collect();
        if values.len() != key_idx.len() {
            return Err(Error::CountMismatch {
                what:     "key",
                expected: key_idx.len(),
                got:      values.len(),
            });
        }
        self.base.key_values(&values)
    }

    fn fields_tail(&self) -> Vec<Vec<u8>> {
        self.base.field_args(self.base.all())
    }

    /// Remove rows from the index and drop their data keys, best effort.
    async fn forget(&self, ctx: &Ctx, index: &str, ids: &[String]) {
        let args = ids.iter().map(|id| id.clone().into_bytes()).collect();
        if let Err(err) = self.base.eval(ctx, ScriptId::RowsDels, vec![index.to_string()], args).await {
            tracing::warn!("could not drop {ids:?} from {index}: {err}");
        }
    }

    async fn to_record(&self, ctx: &Ctx, index: &str, row: Row) -> Result<R> {
        let id = self.id_of(&row);
        match self.base.record(row) {
            Ok(record) => Ok(record),
            Err(err) => {
                self.forget(ctx, index, &[id]).await;
                Err(err)
            }
        }
    }

    async fn fetch_all(&self, ctx: &Ctx, index: &str) -> Result<Option<Vec<Row>>> {
        let mut args = vec![self.base.ttl_arg()];
        args.extend(self.fields_tail());
        let reply = self
            .base
            .eval(ctx, ScriptId::RowsGetAll, vec![index.to_string()], args)
            .await?;
        if reply.is_nil() {
            return Ok(None);
        }
        match self.base.decode_matrix(self.base.all(), reply) {
            Ok(rows) => Ok(Some(rows)),
            Err(err) => {
                if let Err(e) = self
                    .base
                    .eval(ctx, ScriptId::RowsDelAll, vec![index.to_string()], Vec::new())
                    .await
                {
                    tracing::warn!("could not invalidate {index}: {e}");
                }
                Err(err)
            }
        }
    }

    /// Rows aligned with `ids`, or `None` if any of them isn't cached.
    async fn fetch_ids(&self, ctx: &Ctx, index: &str, ids: &[String]) -> Result<Option<Vec<Row>>> {
        let mut args = vec![self.base.ttl_arg(), ids.len().to_string().into_bytes()];
        args.extend(ids.iter().map(|id| id.clone().into_bytes()));
        args.extend(self.fields_tail());
        let reply = self
            .base
            .eval(ctx, ScriptId::RowsGets, vec![index.to_string()], args)
            .await?;
        if reply.is_nil() {
            return Ok(None);
        }
        match self.base.decode_matrix(self.base.all(), reply) {
            Ok(rows) => Ok(Some(rows)),
            Err(err) => {
                self.forget(ctx, index, ids).await;
                Err(err)
            }
        }
    }

    async fn fetch_one(&self, ctx: &Ctx, index: &str, id: &str) -> Result<Option<Row>> {
        let mut args = vec![self.base.ttl_arg(), id.as_bytes().to_vec()];
        args.extend(self.fields_tail());
        let reply = self
            .base
            .eval(ctx, ScriptId::RowsGet, vec![index.to_string()], args)
            .await?;
        if reply.is_nil() {
            return Ok(None);
        }
        match self.base.decode_reply(self.base.all(), reply) {
            Ok(row) => Ok(Some(row)),
            Err(err) => {
                self.forget(ctx, index, &[id.to_string()]).await;
                Err(err)
            }
        }
    }

    fn known_missing(&self, index: &str, target: Target<'_>) -> bool {
        if self.base.is_negative(index) {
            return true;
        }
        match target {
            Target::All => false,
            Target::Ids(keys) => keys
                .iter()
                .all(|key| self.base.is_negative(&data_key(index, &key_values_str(key)))),
        }
    }

    async fn preload(
        &self,
        ctx: &Ctx,
        index: &str,
        cond: &[FieldValue],
        target: Target<'_>,
        create: Option<&[FieldOp]>,
    ) -> Result<Loaded> {
        if create.is_none() && self.known_missing(index, target) {
            self.base.observe_negative(index).await;
            return Ok(Loaded::Missing);
        }

        let lock = self.base.load_lock(ctx, index).await?;
        let cached = match target {
            Target::All => self.fetch_all(ctx, index).await?,
            Target::Ids(keys) => {
                let ids: Vec<String> = keys.iter().map(|key| key_values_str(key)).collect();
                self.fetch_ids(ctx, index, &ids).await?
            }
        };
        if let Some(rows) = cached {
            lock.release().await;
            return Ok(Loaded::Found(rows));
        }

        let loaded = match target {
            Target::All => self.load_all(ctx, index, cond).await,
            Target::Ids(keys) => self.load_ids(ctx, index, cond, keys, create).await,
        };
        lock.release().await;
        loaded
    }

    /// Append one `rowsAdd` entry; without a row only the index member is written.
    fn push_entry(&self, args: &mut Vec<Vec<u8>>, id: &str, row: Option<&[FieldValue]>) {
        args.push(id.as_bytes().to_vec());
        let pairs = row.map(|row| self.base.row_pairs(row)).unwrap_or_default();
        args.push((pairs.len() / 2).to_string().into_bytes());
        args.extend(pairs);
    }

    // The family is rebuilt from scratch: stale members go away with the old index.
    async fn load_all(&self, ctx: &Ctx, index: &str, cond: &[FieldValue]) -> Result<Loaded> {
        let base = &self.base;
        let select = base.select(base.base_filter(cond), base.all());
        let rows = base.query(ctx, &select, base.all()).await?;

        if rows.is_empty() {
            base.eval(ctx, ScriptId::RowsDelAll, vec![index.to_string()], Vec::new())
                .await?;
            base.mark_negative(index);
            return Ok(Loaded::Missing);
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(rows.len());
        let mut args = vec![base.ttl_arg()];
        for row in rows {
            let id = self.id_of(&row);
            if seen.insert(id.clone()) {
                self.push_entry(&mut args, &id, Some(&row));
                unique.push(row);
            }
        }

        let calls = [
            ScriptCall {
                script: Script::get(ScriptId::RowsDelAll),
                keys:   vec![index.to_string()],
                args:   Vec::new(),
            },
            ScriptCall {
                script: Script::get(ScriptId::RowsAdd),
                keys:   vec![index.to_string()],
                args,
            },
        ];
        ctx.run(base.remote().eval_batch(&calls)).await?;
        base.observe_load(index, unique.len()).await;
        Ok(Loaded::Found(unique))
    }

    // Loads the wanted rows plus the ids of the whole family so that the index stays complete.
    async fn load_ids(
        &self,
        ctx: &Ctx,
        index: &str,
        cond: &[FieldValue],
        keys: &[Vec<FieldValue>],
        create: Option<&[FieldOp]>,
    ) -> Result<Loaded> {
        let base = &self.base;
        let rows_select = base.select(
            base.base_filter(cond)
                .or_groups(keys.iter().map(|key| base.predicates(base.key_idx(), key)).collect()),
            base.all(),
        );
        let members_select = base.select(base.base_filter(cond), base.key_idx());

        let mut rows = base.query(ctx, &rows_select, base.all()).await?;
        let mut members = base.query(ctx, &members_select, base.key_idx()).await?;
        let mut created = false;

        if rows.is_empty() {
            if let Some(ops) = create {
                base.insert(ctx, cond, ops).await?;
                base.clear_negative(index);
                for key in keys {
                    base.clear_negative(&data_key(index, &key_values_str(key)));
                }
                rows = base.query(ctx, &rows_select, base.all()).await?;
                members = base.query(ctx, &members_select, base.key_idx()).await?;
                created = !rows.is_empty();
            }
        }

        if members.is_empty() {
            base.eval(ctx, ScriptId::RowsDelAll, vec![index.to_string()], Vec::new())
                .await?;
            base.mark_negative(index);
            return Ok(Loaded::Missing);
        }

        let mut seen = HashSet::new();
        let mut args = vec![base.ttl_arg()];
        for row in &rows {
            let id = self.id_of(row);
            if seen.insert(id.clone()) {
                self.push_entry(&mut args, &id, Some(row));
            }
        }
        for member in &members {
            let id = key_values_str(member);
            if seen.insert(id.clone()) {
                self.push_entry(&mut args, &id, None);
            }
        }
        base.eval(ctx, ScriptId::RowsAdd, vec![index.to_string()], args).await?;
        base.observe_load(index, rows.len()).await;

        for key in keys {
            let id = key_values_str(key);
            if self.pick(&rows, &id).is_none() {
                base.mark_negative(&data_key(index, &id));
            }
        }

        Ok(if rows.is_empty() {
            Loaded::Missing
        }
        else if created {
            Loaded::Created(rows)
        }
        else {
            Loaded::Found(rows)
        })
    }

    async fn get_at(&self, ctx: &Ctx, cond: &[FieldValue], index: &str, key: Vec<FieldValue>) -> Result<Option<R>> {
        let id = key_values_str(&key);
        let row = match self.fetch_one(ctx, index, &id).await? {
            Some(row) => {
                self.base.observe_hit(index).await;
                Some(row)
            }
            None => {
                self.base.observe_miss(index).await;
                match self.preload(ctx, index, cond, Target::Ids(&[key]), None).await? {
                    Loaded::Missing => None,
                    Loaded::Found(rows) | Loaded::Created(rows) => rows.into_iter().find(|row| self.id_of(row) == id),
                }
            }
        };
        match row {
            Some(row) => self.to_record(ctx, index, row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn add_at(
        &self,
        ctx: &Ctx,
        cond: &[FieldValue],
        index: &str,
        key: &[FieldValue],
        ops: &[FieldOp],
    ) -> Result<Option<i64>> {
        let base = &self.base;
        let id = base.insert(ctx, cond, ops).await?;
        base.clear_negative(index);
        base.clear_negative(&data_key(index, &key_values_str(key)));

        // The index no longer lists the whole family.
        let lock = base.load_lock(ctx, index).await?;
        base.eval(ctx, ScriptId::RowsDelAll, vec![index.to_string()], Vec::new())
            .await?;
        lock.release().await;
        Ok(id)
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
        let (cond, index) = self.base.locate(ctx, op, cond).await?;
        self.base
            .traced(ctx, op, &index, async {
                let ops = self.base.normalize(patch)?;
                let key = self.patch_key(&ops)?;
                self.write_at(ctx, &cond, &index, key, ops, mode, opts, returning)
                    .await
            })
            .await
    }

    async fn modify_script(
        &self,
        ctx: &Ctx,
        index: &str,
        id: &str,
        ops: &[FieldOp],
        mode: WriteMode,
        returning: &[usize],
    ) -> Result<Reply> {
        let mut args = vec![
            self.base.ttl_arg(),
            id.as_bytes().to_vec(),
            ops.len().to_string().into_bytes(),
        ];
        args.extend(self.base.op_args(ops, mode));
        let script = if returning.is_empty() {
            ScriptId::RowsModify
        }
        else {
            args.extend(self.base.field_args(returning));
            ScriptId::RowsModifyGet
        };
        self.base.eval(ctx, script, vec![index.to_string()], args).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_at(
        &self,
        ctx: &Ctx,
        cond: &[FieldValue],
        index: &str,
        key: Vec<FieldValue>,
        ops: Vec<FieldOp>,
        mode: WriteMode,
        opts: SetOptions,
        returning: Returning,
    ) -> Result<Vec<(usize, FieldValue)>> {
        let base = &self.base;
        let id = key_values_str(&key);
        let dkey = data_key(index, &id);
        let writable = base.writable(&ops);
        let positions: Vec<usize> = match returning {
            Returning::Nothing => Vec::new(),
            Returning::Row => base.all().to_vec(),
            Returning::Mutated => writable.iter().map(|op| op.idx).collect(),
        };

        let lock = base.save_lock(ctx, index).await?;
        let mut reply = self
            .modify_script(ctx, index, &id, &writable, mode, &positions)
            .await?;

        if reply.is_nil() {
            base.observe_miss(&dkey).await;
            let create = opts.no_exist_create.then_some(&ops[..]);
            match self
                .preload(ctx, index, cond, Target::Ids(std::slice::from_ref(&key)), create)
                .await?
            {
                Loaded::Missing => {
                    lock.release().await;
                    return Err(Error::NoData);
                }
                // The inserted row already carries the patch.
                Loaded::Created(rows) => {
                    lock.release().await;
                    let row = rows.into_iter().find(|row| self.id_of(row) == id).ok_or(Error::NoData)?;
                    return Ok(positions.into_iter().map(|idx| (idx, row[idx].clone())).collect());
                }
                Loaded::Found(_) => {
                    reply = self
                        .modify_script(ctx, index, &id, &writable, mode, &positions)
                        .await?;
                    if reply.is_nil() {
                        lock.release().await;
                        return Err(Error::NoData);
                    }
                }
            }
        }

        let filter = base.base_filter(cond).and(base.predicates(base.key_idx(), &key));
        let update = base.update(filter, &writable, mode);
        let compensation = Compensation::key(dkey.clone()).with_index_member(index, id.clone());
        base.write_through(ctx, &dkey, update, compensation, lock).await?;

        if positions.is_empty() {
            return Ok(Vec::new());
        }
        match base.decode_reply(&positions, reply) {
            Ok(values) => Ok(positions.into_iter().zip(values).collect()),
            Err(err) => {
                self.forget(ctx, index, &[id]).await;
                Err(err)
            }
        }
    }
}
