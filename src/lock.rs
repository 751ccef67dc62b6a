//! Advisory locks held in the remote store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::traits::RemoteStore;

/// How long an acquirer waits for a busy lock. It is also the lifetime of a lock whose holder never releases it.
pub const LOCK_WAIT: Duration = Duration::from_secs(8);

const MIN_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// An acquired lock. Prefer [`release()`](LockGuard::release); a guard dropped without it schedules the release on the
/// current tokio runtime.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    store: Option<Arc<dyn RemoteStore>>,
    key:   String,
    token: String,
}

impl LockGuard {
    /// A guard for a lock that was never taken. Used when locking is disabled.
    pub(crate) fn noop(key: String) -> Self {
        Self {
            store: None,
            key,
            token: String::new(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        if let Some(store) = self.store.take() {
            match store.unlock(&self.key, &self.token).await {
                Ok(true) => trace!("released {}", self.key),
                Ok(false) => warn!("lock {} expired before release", self.key),
                Err(err) => warn!("failed to release {}: {err}", self.key),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take()
        else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.unlock(&key, &token).await {
                        warn!("failed to release {key} on drop: {err}");
                    }
                });
            }
            Err(_) => warn!("{key} dropped outside of a runtime; it will expire on its own"),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.store.is_some())
            .finish()
    }
}

/// Poll the store until the lock is taken or `wait` runs out.
pub async fn acquire(store: &Arc<dyn RemoteStore>, key: String, wait: Duration) -> Result<LockGuard> {
    let token = format!("{:016x}", rand::random::<u64>());
    let deadline = Instant::now() + wait;
    let mut backoff = MIN_BACKOFF;
    let mut waited = false;

    loop {
        if store.try_lock(&key, &token, wait).await? {
            if waited {
                debug!("acquired {key} after waiting");
            }
            return Ok(LockGuard {
                store: Some(Arc::clone(store)),
                key,
                token,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::LockTimeout(key));
        }
        waited = true;
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;

    #[tokio::test]
    async fn exclusive_until_released() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let first = acquire(&store, "k_lock_save".into(), LOCK_WAIT).await.unwrap();

        let err = acquire(&store, "k_lock_save".into(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        first.release().await;
        let second = acquire(&store, "k_lock_save".into(), Duration::from_millis(30)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_holder_drops() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let guard = acquire(&store, "k".into(), LOCK_WAIT).await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { acquire(&store, "k".into(), LOCK_WAIT).await.map(|g| g.key().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(waiter.await.unwrap().unwrap(), "k");
    }
}
