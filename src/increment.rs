//! Auto-increment ids allocated from the remote store.
//!
//! Every shard of a table draws ids from one counter (a field of [`INCREMENT_KEY`] named after the base table). Shard
//! `i` of `N` bumps the counter by `N` and moves the result up to the next value congruent to `i` modulo `N`, so ids of
//! different shards never collide.

use std::sync::Arc;

use crate::context::Ctx;
use crate::error::Result;
use crate::key::INCREMENT_KEY;
use crate::scripts::Script;
use crate::scripts::ScriptId;
use crate::traits::RemoteStore;

/// Gap left above the SQL maximum when the counter turned out to be behind the table.
pub const RECOVERY_GAP: i64 = 1000;

#[derive(Debug, Clone)]
pub(crate) struct IdAllocator {
    remote:      Arc<dyn RemoteStore>,
    table:       String,
    shard_count: u32,
    shard_index: u32,
}

impl IdAllocator {
    pub(crate) fn new(remote: Arc<dyn RemoteStore>, table: String, shard_count: u32, shard_index: u32) -> Self {
        Self {
            remote,
            table,
            shard_count,
            shard_index,
        }
    }

    pub(crate) async fn next(&self, ctx: &Ctx) -> Result<i64> {
        let reply = ctx
            .run(self.remote.eval(
                Script::get(ScriptId::Incr),
                &[INCREMENT_KEY.to_string()],
                &[
                    self.table.clone().into_bytes(),
                    self.shard_count.max(1).to_string().into_bytes(),
                    self.shard_index.to_string().into_bytes(),
                ],
            ))
            .await?;
        Ok(reply.as_int()?)
    }

    /// Restart the counter at `value`.
    pub(crate) async fn reset(&self, ctx: &Ctx, value: i64) -> Result<()> {
        ctx.run(self.remote.eval(
            Script::get(ScriptId::IncrSet),
            &[INCREMENT_KEY.to_string()],
            &[self.table.clone().into_bytes(), value.to_string().into_bytes()],
        ))
        .await?;
        Ok(())
    }

    /// First id not below `max + RECOVERY_GAP` that belongs to this shard.
    pub(crate) fn recovery_id(&self, max: i64) -> i64 {
        align(max + RECOVERY_GAP, self.shard_count, self.shard_index)
    }
}

/// Smallest `v >= value` with `v mod count == index`. Unsharded tables take the value as is.
pub fn align(value: i64, count: u32, index: u32) -> i64 {
    if count <= 1 {
        return value;
    }
    let count = i64::from(count);
    value + (i64::from(index) - value).rem_euclid(count)
}
