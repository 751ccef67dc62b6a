//! Server-side scripts executed atomically by the remote store.
//!
//! Each script is identified by a [`ScriptId`]; backends that understand Lua (Redis) run [`Script::source()`],
//! others (the in-memory store) dispatch on the id and reproduce the same semantics natively.
//!
//! Argument conventions shared by all scripts:
//!
//! * `KEYS[1]` is the cache key. For multi-row scripts it is the index key; data keys are derived in-script as
//!   `KEYS[1] .. '_' .. id`.
//! * `ttl` is whole seconds.
//! * modify operations come as `n` triples `field, op, value` where `op` is one of `set`, `del`, `incr` or `fincr`.
//!   The value of a `del` is an empty placeholder.

use std::fmt::Debug;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptId {
    /// `KEYS[1]`; `ttl, field*` → values or nil when the key is missing.
    RowGet,
    /// `KEYS[1]`; `ttl, (field, value)*` → replaces the hash.
    RowAdd,
    /// `KEYS[1]`; `ttl, n, (field, op, value)*n` → `OK` or nil when the key is missing.
    RowModify,
    /// Like `RowModify` followed by `field*` to return after the modification.
    RowModifyGet,
    /// `KEYS[1]`; `ttl, field*` → one value array per member, or nil when any part is missing.
    RowsGetAll,
    /// `KEYS[1]`; `ttl, count, id*count, field*` → one value array per id, or nil when any part is missing.
    RowsGets,
    /// `KEYS[1]`; `ttl, id, field*` → values, or nil.
    RowsGet,
    /// `KEYS[1]`; `ttl, id` → 1 if the id is indexed, 0 if not, nil if the index is missing.
    RowsExist,
    /// `KEYS[1]`; `ttl, (id, count, (field, value)*count)*` → writes data keys and index members.
    RowsAdd,
    /// `KEYS[1]`; `id*` → removes the ids from the index and their data keys.
    RowsDels,
    /// `KEYS[1]` → removes the index and all data keys, returns the number of members.
    RowsDelAll,
    /// `KEYS[1]`; `ttl, id, n, (field, op, value)*n` → `OK` or nil.
    RowsModify,
    /// Like `RowsModify` followed by `field*` to return.
    RowsModifyGet,
    /// `KEYS[1]`; `table, shard_count, shard_index` → next auto-increment value.
    Incr,
    /// `KEYS[1]`; `table, value` → resets the counter.
    IncrSet,
    /// `KEYS[1]`; `token` → 1 if the lock was held with the token and got released.
    Unlock,
}

impl ScriptId {
    pub const ALL: [ScriptId; 16] = [
        ScriptId::RowGet,
        ScriptId::RowAdd,
        ScriptId::RowModify,
        ScriptId::RowModifyGet,
        ScriptId::RowsGetAll,
        ScriptId::RowsGets,
        ScriptId::RowsGet,
        ScriptId::RowsExist,
        ScriptId::RowsAdd,
        ScriptId::RowsDels,
        ScriptId::RowsDelAll,
        ScriptId::RowsModify,
        ScriptId::RowsModifyGet,
        ScriptId::Incr,
        ScriptId::IncrSet,
        ScriptId::Unlock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RowGet => "rowGet",
            Self::RowAdd => "rowAdd",
            Self::RowModify => "rowModify",
            Self::RowModifyGet => "rowModifyGet",
            Self::RowsGetAll => "rowsGetAll",
            Self::RowsGets => "rowsGets",
            Self::RowsGet => "rowsGet",
            Self::RowsExist => "rowsExist",
            Self::RowsAdd => "rowsAdd",
            Self::RowsDels => "rowsDels",
            Self::RowsDelAll => "rowsDelAll",
            Self::RowsModify => "rowsModify",
            Self::RowsModifyGet => "rowsModifyGet",
            Self::Incr => "incr",
            Self::IncrSet => "incrSet",
            Self::Unlock => "unlock",
        }
    }
}

pub struct Script {
    id:     ScriptId,
    source: String,
}

impl Script {
    #[inline]
    pub fn id(&self) -> ScriptId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn get(id: ScriptId) -> &'static Script {
        &SCRIPTS[id as usize]
    }
}

impl Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Script").field(&self.name()).finish()
    }
}

static SCRIPTS: LazyLock<Vec<Script>> = LazyLock::new(|| {
    ScriptId::ALL
        .iter()
        .map(|&id| Script {
            id,
            source: source_of(id),
        })
        .collect()
});

const APPLY_OPS: &str = r#"
local function apply_ops(key, base, n)
    for i = 0, n - 1 do
        local f = ARGV[base + i * 3]
        local op = ARGV[base + i * 3 + 1]
        local v = ARGV[base + i * 3 + 2]
        if op == 'set' then
            redis.call('HSET', key, f, v)
        elseif op == 'del' then
            redis.call('HDEL', key, f)
        elseif op == 'incr' then
            redis.call('HINCRBY', key, f, v)
        elseif op == 'fincr' then
            redis.call('HINCRBYFLOAT', key, f, v)
        else
            error('unknown modify operation ' .. op)
        end
    end
end
"#;

const ROWS_FETCH: &str = r#"
local function fetch_rows(index, ttl, ids, fields)
    local rows = {}
    for i, id in ipairs(ids) do
        local dk = index .. '_' .. id
        if redis.call('EXPIRE', dk, ttl) == 0 then
            return nil
        end
        rows[i] = redis.call('HMGET', dk, unpack(fields))
    end
    return rows
end
"#;

fn source_of(id: ScriptId) -> String {
    match id {
        ScriptId::RowGet => r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
return redis.call('HMGET', KEYS[1], unpack(ARGV, 2))
"#
        .to_string(),

        ScriptId::RowAdd => r#"
redis.call('DEL', KEYS[1])
for i = 2, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return redis.status_reply('OK')
"#
        .to_string(),

        ScriptId::RowModify => format!(
            "{APPLY_OPS}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
apply_ops(KEYS[1], 3, tonumber(ARGV[2]))
return redis.status_reply('OK')
"#
        ),

        ScriptId::RowModifyGet => format!(
            "{APPLY_OPS}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
local n = tonumber(ARGV[2])
apply_ops(KEYS[1], 3, n)
return redis.call('HMGET', KEYS[1], unpack(ARGV, 3 + n * 3))
"#
        ),

        ScriptId::RowsGetAll => format!(
            "{ROWS_FETCH}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
local ids = redis.call('SMEMBERS', KEYS[1])
local fields = {}
for i = 2, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
return fetch_rows(KEYS[1], ARGV[1], ids, fields)
"#
        ),

        ScriptId::RowsGets => format!(
            "{ROWS_FETCH}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
local count = tonumber(ARGV[2])
local ids = {}
for i = 1, count do
    local id = ARGV[2 + i]
    if redis.call('SISMEMBER', KEYS[1], id) == 0 then
        return nil
    end
    ids[i] = id
end
local fields = {}
for i = 3 + count, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
return fetch_rows(KEYS[1], ARGV[1], ids, fields)
"#
        ),

        ScriptId::RowsGet => r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
if redis.call('SISMEMBER', KEYS[1], ARGV[2]) == 0 then
    return nil
end
local dk = KEYS[1] .. '_' .. ARGV[2]
if redis.call('EXPIRE', dk, ARGV[1]) == 0 then
    return nil
end
return redis.call('HMGET', dk, unpack(ARGV, 3))
"#
        .to_string(),

        ScriptId::RowsExist => r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
return redis.call('SISMEMBER', KEYS[1], ARGV[2])
"#
        .to_string(),

        ScriptId::RowsAdd => r#"
local ttl = ARGV[1]
local i = 2
while i <= #ARGV do
    local id = ARGV[i]
    local count = tonumber(ARGV[i + 1])
    i = i + 2
    if count > 0 then
        local dk = KEYS[1] .. '_' .. id
        redis.call('DEL', dk)
        for j = 0, count - 1 do
            redis.call('HSET', dk, ARGV[i + j * 2], ARGV[i + j * 2 + 1])
        end
        redis.call('EXPIRE', dk, ttl)
        i = i + count * 2
    end
    redis.call('SADD', KEYS[1], id)
end
redis.call('EXPIRE', KEYS[1], ttl)
return redis.status_reply('OK')
"#
        .to_string(),

        ScriptId::RowsDels => r#"
local n = 0
for i = 1, #ARGV do
    n = n + redis.call('SREM', KEYS[1], ARGV[i])
    redis.call('DEL', KEYS[1] .. '_' .. ARGV[i])
end
return n
"#
        .to_string(),

        ScriptId::RowsDelAll => r#"
local ids = redis.call('SMEMBERS', KEYS[1])
for _, id in ipairs(ids) do
    redis.call('DEL', KEYS[1] .. '_' .. id)
end
redis.call('DEL', KEYS[1])
return #ids
"#
        .to_string(),

        ScriptId::RowsModify => format!(
            "{APPLY_OPS}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
if redis.call('SISMEMBER', KEYS[1], ARGV[2]) == 0 then
    return nil
end
local dk = KEYS[1] .. '_' .. ARGV[2]
if redis.call('EXPIRE', dk, ARGV[1]) == 0 then
    return nil
end
apply_ops(dk, 4, tonumber(ARGV[3]))
return redis.status_reply('OK')
"#
        ),

        ScriptId::RowsModifyGet => format!(
            "{APPLY_OPS}{}",
            r#"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return nil
end
if redis.call('SISMEMBER', KEYS[1], ARGV[2]) == 0 then
    return nil
end
local dk = KEYS[1] .. '_' .. ARGV[2]
if redis.call('EXPIRE', dk, ARGV[1]) == 0 then
    return nil
end
local n = tonumber(ARGV[3])
apply_ops(dk, 4, n)
return redis.call('HMGET', dk, unpack(ARGV, 4 + n * 3))
"#
        ),

        ScriptId::Incr => r#"
local step = tonumber(ARGV[2])
if step <= 1 then
    return redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
end
local idx = tonumber(ARGV[3])
local v = redis.call('HINCRBY', KEYS[1], ARGV[1], step)
local r = v % step
if r ~= idx then
    v = v + ((idx - r) % step)
    redis.call('HSET', KEYS[1], ARGV[1], v)
end
return v
"#
        .to_string(),

        ScriptId::IncrSet => r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return redis.status_reply('OK')
"#
        .to_string(),

        ScriptId::Unlock => r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#
        .to_string(),
    }
}
