//! A process-local remote store.
//!
//! Implements the subset of the Redis data model the caches rely on (strings, hashes, sets, per-key TTLs) and runs
//! every [`ScriptId`] natively under one mutex, which gives scripts the same atomicity the Lua versions get from Redis.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::traits::RemoteStore;
use crate::traits::StoreError;
use crate::types::Reply;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Slot {
    value:      Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

type OpResult<T> = std::result::Result<T, String>;

impl Keyspace {
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .slots
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= Instant::now()));
        if expired {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.slot(key).is_some()
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return self.del(key);
        }
        match self.slot(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn ttl(&mut self, key: &str) -> Option<Duration> {
        self.slot(key)?
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn del(&mut self, key: &str) -> bool {
        let live = self.exists(key);
        self.slots.remove(key);
        live
    }

    fn entry(&mut self, key: &str, empty: impl FnOnce() -> Value) -> &mut Value {
        // Purge an expired value first.
        self.slot(key);
        &mut self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                value:      empty(),
                expires_at: None,
            })
            .value
    }

    fn hash_mut(&mut self, key: &str) -> OpResult<&mut HashMap<String, Vec<u8>>> {
        match self.entry(key, || Value::Hash(HashMap::new())) {
            Value::Hash(hash) => Ok(hash),
            _ => Err(WRONG_TYPE.to_string()),
        }
    }

    fn set_mut(&mut self, key: &str) -> OpResult<&mut BTreeSet<String>> {
        match self.entry(key, || Value::Set(BTreeSet::new())) {
            Value::Set(set) => Ok(set),
            _ => Err(WRONG_TYPE.to_string()),
        }
    }

    fn hash(&mut self, key: &str) -> OpResult<Option<&HashMap<String, Vec<u8>>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(_) => Err(WRONG_TYPE.to_string()),
        }
    }

    fn set(&mut self, key: &str) -> OpResult<Option<&BTreeSet<String>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Set(set), ..
            }) => Ok(Some(set)),
            Some(_) => Err(WRONG_TYPE.to_string()),
        }
    }

    fn string(&mut self, key: &str) -> OpResult<Option<&Vec<u8>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s), ..
            }) => Ok(Some(s)),
            Some(_) => Err(WRONG_TYPE.to_string()),
        }
    }

    // Containers never stay around empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.slots.get(key).map(|slot| &slot.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::Set(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.slots.remove(key);
        }
    }

    fn hset(&mut self, key: &str, field: &str, value: &[u8]) -> OpResult<()> {
        self.hash_mut(key)?.insert(field.to_string(), value.to_vec());
        Ok(())
    }

    fn hdel(&mut self, key: &str, field: &str) -> OpResult<()> {
        if self.hash(key)?.is_some() {
            self.hash_mut(key)?.remove(field);
            self.drop_if_empty(key);
        }
        Ok(())
    }

    fn hmget(&mut self, key: &str, fields: &[Vec<u8>]) -> OpResult<Reply> {
        let hash = self.hash(key)?;
        Ok(Reply::Array(
            fields
                .iter()
                .map(|field| {
                    let field = String::from_utf8_lossy(field);
                    hash.and_then(|h| h.get(field.as_ref()))
                        .map_or(Reply::Nil, |v| Reply::Data(v.clone()))
                })
                .collect(),
        ))
    }

    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> OpResult<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            None => 0,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| "ERR hash value is not an integer".to_string())?,
        };
        let value = current
            .checked_add(delta)
            .ok_or_else(|| "ERR increment or decrement would overflow".to_string())?;
        hash.insert(field.to_string(), value.to_string().into_bytes());
        Ok(value)
    }

    fn hincrbyfloat(&mut self, key: &str, field: &str, delta: f64) -> OpResult<f64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            None => 0.0,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| "ERR hash value is not a float".to_string())?,
        };
        let value = current + delta;
        if !value.is_finite() {
            return Err("ERR increment would produce NaN or Infinity".to_string());
        }
        hash.insert(field.to_string(), value.to_string().into_bytes());
        Ok(value)
    }

    fn sadd(&mut self, key: &str, member: &str) -> OpResult<bool> {
        Ok(self.set_mut(key)?.insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> OpResult<bool> {
        if self.set(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.set_mut(key)?.remove(member);
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn sismember(&mut self, key: &str, member: &str) -> OpResult<bool> {
        Ok(self.set(key)?.is_some_and(|set| set.contains(member)))
    }

    fn smembers(&mut self, key: &str) -> OpResult<Vec<String>> {
        Ok(self
            .set(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// `ARGV` of a script, zero-based.
struct Argv<'a>(&'a [Vec<u8>]);

impl<'a> Argv<'a> {
    fn bytes(&self, i: usize) -> OpResult<&'a [u8]> {
        self.0
            .get(i)
            .map(Vec::as_slice)
            .ok_or_else(|| format!("missing ARGV[{}]", i + 1))
    }

    fn str(&self, i: usize) -> OpResult<&'a str> {
        std::str::from_utf8(self.bytes(i)?).map_err(|_| format!("ARGV[{}] is not valid UTF-8", i + 1))
    }

    fn int(&self, i: usize) -> OpResult<i64> {
        self.str(i)?
            .parse()
            .map_err(|_| format!("ARGV[{}] is not an integer", i + 1))
    }

    fn ttl(&self, i: usize) -> OpResult<Duration> {
        Ok(Duration::from_secs(u64::try_from(self.int(i)?).unwrap_or(0)))
    }

    fn tail(&self, i: usize) -> &'a [Vec<u8>] {
        self.0.get(i..).unwrap_or_default()
    }

    fn range(&self, from: usize, len: usize) -> OpResult<&'a [Vec<u8>]> {
        self.0
            .get(from..from + len)
            .ok_or_else(|| format!("expected {len} arguments from ARGV[{}]", from + 1))
    }
}

fn utf8(raw: &[u8]) -> OpResult<&str> {
    std::str::from_utf8(raw).map_err(|_| "argument is not valid UTF-8".to_string())
}

impl Keyspace {
    fn apply_ops(&mut self, key: &str, triples: &[Vec<u8>]) -> OpResult<()> {
        for op in triples.chunks(3) {
            let [field, op, value] = op
            else {
                return Err("incomplete modify triple".to_string());
            };
            let field = utf8(field)?;
            match op.as_slice() {
                b"set" => self.hset(key, field, value)?,
                b"del" => self.hdel(key, field)?,
                b"incr" => {
                    let delta = utf8(value)?
                        .parse::<i64>()
                        .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
                    self.hincrby(key, field, delta)?;
                }
                b"fincr" => {
                    let delta = utf8(value)?
                        .parse::<f64>()
                        .map_err(|_| "ERR value is not a valid float".to_string())?;
                    self.hincrbyfloat(key, field, delta)?;
                }
                other => return Err(format!("unknown modify operation {}", String::from_utf8_lossy(other))),
            }
        }
        Ok(())
    }

    fn fetch_rows(&mut self, index: &str, ttl: Duration, ids: &[String], fields: &[Vec<u8>]) -> OpResult<Reply> {
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let dk = format!("{index}_{id}");
            if !self.expire(&dk, ttl) {
                return Ok(Reply::Nil);
            }
            rows.push(self.hmget(&dk, fields)?);
        }
        Ok(Reply::Array(rows))
    }

    fn run(&mut self, id: ScriptId, keys: &[String], args: &[Vec<u8>]) -> OpResult<Reply> {
        let key = keys.first().ok_or_else(|| "missing KEYS[1]".to_string())?.as_str();
        let argv = Argv(args);
        let ok = || Reply::Status("OK".to_string());

        match id {
            ScriptId::RowGet => {
                if !self.expire(key, argv.ttl(0)?) {
                    return Ok(Reply::Nil);
                }
                self.hmget(key, argv.tail(1))
            }

            ScriptId::RowAdd => {
                self.del(key);
                for pair in argv.tail(1).chunks(2) {
                    let [field, value] = pair
                    else {
                        return Err("odd number of field/value arguments".to_string());
                    };
                    self.hset(key, utf8(field)?, value)?;
                }
                self.expire(key, argv.ttl(0)?);
                Ok(ok())
            }

            ScriptId::RowModify | ScriptId::RowModifyGet => {
                if !self.expire(key, argv.ttl(0)?) {
                    return Ok(Reply::Nil);
                }
                let n = usize::try_from(argv.int(1)?).map_err(|_| "negative operation count".to_string())?;
                self.apply_ops(key, argv.range(2, n * 3)?)?;
                if id == ScriptId::RowModify {
                    Ok(ok())
                }
                else {
                    self.hmget(key, argv.tail(2 + n * 3))
                }
            }

            ScriptId::RowsGetAll => {
                let ttl = argv.ttl(0)?;
                if !self.expire(key, ttl) {
                    return Ok(Reply::Nil);
                }
                let ids = self.smembers(key)?;
                self.fetch_rows(key, ttl, &ids, argv.tail(1))
            }

            ScriptId::RowsGets => {
                let ttl = argv.ttl(0)?;
                if !self.expire(key, ttl) {
                    return Ok(Reply::Nil);
                }
                let count = usize::try_from(argv.int(1)?).map_err(|_| "negative id count".to_string())?;
                let mut ids = Vec::with_capacity(count);
                for raw in argv.range(2, count)? {
                    let id = utf8(raw)?;
                    if !self.sismember(key, id)? {
                        return Ok(Reply::Nil);
                    }
                    ids.push(id.to_string());
                }
                self.fetch_rows(key, ttl, &ids, argv.tail(2 + count))
            }

            ScriptId::RowsGet => {
                let ttl = argv.ttl(0)?;
                if !self.expire(key, ttl) {
                    return Ok(Reply::Nil);
                }
                let id = argv.str(1)?;
                if !self.sismember(key, id)? {
                    return Ok(Reply::Nil);
                }
                let dk = format!("{key}_{id}");
                if !self.expire(&dk, ttl) {
                    return Ok(Reply::Nil);
                }
                self.hmget(&dk, argv.tail(2))
            }

            ScriptId::RowsExist => {
                if !self.expire(key, argv.ttl(0)?) {
                    return Ok(Reply::Nil);
                }
                Ok(Reply::Int(i64::from(self.sismember(key, argv.str(1)?)?)))
            }

            ScriptId::RowsAdd => {
                let ttl = argv.ttl(0)?;
                let mut i = 1;
                while i < args.len() {
                    let id = argv.str(i)?;
                    let count = usize::try_from(argv.int(i + 1)?).map_err(|_| "negative field count".to_string())?;
                    i += 2;
                    if count > 0 {
                        let dk = format!("{key}_{id}");
                        self.del(&dk);
                        for pair in argv.range(i, count * 2)?.chunks(2) {
                            self.hset(&dk, utf8(&pair[0])?, &pair[1])?;
                        }
                        self.expire(&dk, ttl);
                        i += count * 2;
                    }
                    self.sadd(key, id)?;
                }
                self.expire(key, ttl);
                Ok(ok())
            }

            ScriptId::RowsDels => {
                let mut removed = 0;
                for raw in args {
                    let id = utf8(raw)?;
                    removed += i64::from(self.srem(key, id)?);
                    self.del(&format!("{key}_{id}"));
                }
                Ok(Reply::Int(removed))
            }

            ScriptId::RowsDelAll => {
                let ids = self.smembers(key)?;
                for id in &ids {
                    self.del(&format!("{key}_{id}"));
                }
                self.del(key);
                Ok(Reply::Int(ids.len() as i64))
            }

            ScriptId::RowsModify | ScriptId::RowsModifyGet => {
                let ttl = argv.ttl(0)?;
                if !self.expire(key, ttl) {
                    return Ok(Reply::Nil);
                }
                let member = argv.str(1)?;
                if !self.sismember(key, member)? {
                    return Ok(Reply::Nil);
                }
                let dk = format!("{key}_{member}");
                if !self.expire(&dk, ttl) {
                    return Ok(Reply::Nil);
                }
                let n = usize::try_from(argv.int(2)?).map_err(|_| "negative operation count".to_string())?;
                self.apply_ops(&dk, argv.range(3, n * 3)?)?;
                if id == ScriptId::RowsModify {
                    Ok(ok())
                }
                else {
                    self.hmget(&dk, argv.tail(3 + n * 3))
                }
            }

            ScriptId::Incr => {
                let table = argv.str(0)?;
                let step = argv.int(1)?;
                if step <= 1 {
                    return self.hincrby(key, table, 1).map(Reply::Int);
                }
                let idx = argv.int(2)?;
                let mut v = self.hincrby(key, table, step)?;
                let r = v.rem_euclid(step);
                if r != idx {
                    v += (idx - r).rem_euclid(step);
                    self.hset(key, table, v.to_string().as_bytes())?;
                }
                Ok(Reply::Int(v))
            }

            ScriptId::IncrSet => {
                self.hset(key, argv.str(0)?, argv.bytes(1)?)?;
                Ok(ok())
            }

            ScriptId::Unlock => {
                let held = self.string(key)?.is_some_and(|token| token.as_slice() == argv.bytes(0).unwrap_or_default());
                Ok(Reply::Int(i64::from(held && self.del(key))))
            }
        }
    }
}

/// In-process [`RemoteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    evals:    AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scripts run so far.
    pub fn evals(&self) -> u64 {
        self.evals.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keyspace.lock().exists(key)
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.keyspace.lock().ttl(key)
    }

    /// Fields of a hash, values rendered as text.
    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        let mut keyspace = self.keyspace.lock();
        let hash = keyspace.hash(key).ok()??;
        Some(
            hash.iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
        )
    }

    pub fn members(&self, key: &str) -> Option<BTreeSet<String>> {
        self.keyspace.lock().set(key).ok()?.cloned()
    }

    /// Store a raw hash field, bypassing every script.
    pub fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        self.keyspace.lock().hset(key, field, value).map_err(StoreError::Backend)
    }

    /// Drop everything.
    pub fn flush(&self) {
        self.keyspace.lock().slots.clear();
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn eval(&self, script: &Script, keys: &[String], args: &[Vec<u8>]) -> Result<Reply, StoreError> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        trace!("eval {} {keys:?}", script.name());
        self.keyspace
            .lock()
            .run(script.id(), keys, args)
            .map_err(|message| StoreError::Script {
                name: script.name(),
                message,
            })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut keyspace = self.keyspace.lock();
        Ok(keys.iter().filter(|key| keyspace.del(key)).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().exists(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().expire(key, ttl))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace.lock();
        if keyspace.exists(key) {
            return Ok(false);
        }
        keyspace.slots.insert(
            key.to_string(),
            Slot {
                value:      Value::Str(token.as_bytes().to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let reply = self
            .eval(Script::get(ScriptId::Unlock), &[key.to_string()], &[token.as_bytes().to_vec()])
            .await?;
        Ok(reply.as_int()? == 1)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut keyspace = self.keyspace.lock();
        let mut added = 0;
        for member in members {
            added += u64::from(keyspace.sadd(key, member).map_err(StoreError::Backend)?);
        }
        Ok(added)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut keyspace = self.keyspace.lock();
        let mut removed = 0;
        for member in members {
            removed += u64::from(keyspace.srem(key, member).map_err(StoreError::Backend)?);
        }
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.keyspace
            .lock()
            .sismember(key, member)
            .map_err(StoreError::Backend)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.keyspace.lock().smembers(key).map_err(StoreError::Backend)
    }
}
