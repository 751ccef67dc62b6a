//! Redis remote store over a `deadpool-redis` connection pool.
//!
//! Scripts run through `EVALSHA`, falling back to loading them on a `NOSCRIPT` reply. Batches are pipelined.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Config;
use deadpool_redis::Connection;
use deadpool_redis::Pool;
use deadpool_redis::Runtime;
use redis::Value;
use tracing::debug;

use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::traits::RemoteStore;
use crate::traits::StoreError;
use crate::types::Reply;
use crate::types::ScriptCall;

#[derive(Clone)]
pub struct RedisStore {
    pool:    Pool,
    scripts: Vec<redis::Script>,
}

impl RedisStore {
    /// Connect to `redis://…` with a pool of at most `pool_size` connections.
    pub fn new(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| StoreError::Backend(format!("invalid redis configuration: {e}")))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Backend(format!("redis pool creation failed: {e}")))?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: Pool) -> Self {
        Self {
            pool,
            scripts: ScriptId::ALL
                .iter()
                .map(|&id| redis::Script::new(Script::get(id).source()))
                .collect(),
        }
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(format!("redis pool connection error: {e}")))
    }

    fn invocation<'a>(&'a self, script: &Script, keys: &[String], args: &[Vec<u8>]) -> redis::ScriptInvocation<'a> {
        let mut invocation = self.scripts[script.id() as usize].prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }
        invocation
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_reply(value: Value) -> Result<Reply, StoreError> {
    Ok(match value {
        Value::Nil => Reply::Nil,
        Value::Int(i) => Reply::Int(i),
        Value::BulkString(data) => Reply::Data(data),
        Value::SimpleString(s) => Reply::Status(s),
        Value::Okay => Reply::Status("OK".to_string()),
        Value::Boolean(b) => Reply::Int(i64::from(b)),
        Value::Double(d) => Reply::Data(d.to_string().into_bytes()),
        Value::Array(items) | Value::Set(items) => Reply::Array(items.into_iter().map(to_reply).collect::<Result<_, _>>()?),
        other => return Err(StoreError::UnexpectedReply(format!("{other:?}"))),
    })
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn eval(&self, script: &Script, keys: &[String], args: &[Vec<u8>]) -> Result<Reply, StoreError> {
        let mut conn = self.connection().await?;
        let value: Value = self
            .invocation(script, keys, args)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Script {
                name:    script.name(),
                message: e.to_string(),
            })?;
        to_reply(value)
    }

    async fn eval_batch(&self, calls: &[ScriptCall]) -> Result<Vec<Reply>, StoreError> {
        let mut conn = self.connection().await?;
        let invocations: Vec<_> = calls
            .iter()
            .map(|call| self.invocation(call.script, &call.keys, &call.args))
            .collect();

        // EVALSHA inside a pipeline doesn't retry on NOSCRIPT.
        let mut loaded = Vec::new();
        for (call, invocation) in calls.iter().zip(&invocations) {
            if !loaded.contains(&call.script.id()) {
                invocation.load_async(&mut conn).await.map_err(backend)?;
                loaded.push(call.script.id());
            }
        }

        let mut pipe = redis::pipe();
        for invocation in &invocations {
            pipe.invoke_script(invocation);
        }
        let values: Vec<Value> = pipe.query_async(&mut conn).await.map_err(backend)?;
        debug!("pipelined {} scripts", values.len());
        values.into_iter().map(to_reply).collect()
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let reply = self
            .eval(Script::get(ScriptId::Unlock), &[key.to_string()], &[token.as_bytes().to_vec()])
            .await?;
        Ok(reply.as_int()? == 1)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }
}
