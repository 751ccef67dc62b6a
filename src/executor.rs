//! Deferred SQL writes.
//!
//! With `write_async` enabled a cache returns as soon as the remote store accepted a modification; the matching SQL
//! UPDATE becomes a [`WriteJob`] executed by an [`AsyncExecutor`] worker. A job owns the save lock of its key and the
//! list of keys to drop should the UPDATE fail.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::lock::LockGuard;
use crate::sql::Update;
use crate::traits::CacheObserver;
use crate::traits::RemoteStore;
use crate::traits::SqlStore;

/// Cache entries to drop when the SQL write they mirror didn't go through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compensation {
    pub keys:          Vec<String>,
    /// `(index key, member)` to remove from a multi-row index.
    pub index_members: Vec<(String, String)>,
}

impl Compensation {
    pub fn key<S: Into<String>>(key: S) -> Self {
        Self {
            keys:          vec![key.into()],
            index_members: Vec::new(),
        }
    }

    pub fn with_index_member<I: Into<String>, M: Into<String>>(mut self, index: I, member: M) -> Self {
        self.index_members.push((index.into(), member.into()));
        self
    }

    pub(crate) async fn apply(&self, remote: &dyn RemoteStore) {
        for (index, member) in &self.index_members {
            if let Err(err) = remote.srem(index, std::slice::from_ref(member)).await {
                warn!("could not remove '{member}' from {index}: {err}");
            }
        }
        if !self.keys.is_empty() {
            match remote.del(&self.keys).await {
                Ok(_) => warn!("invalidated {:?} after a failed SQL write", self.keys),
                Err(err) => warn!("could not invalidate {:?}: {err}", self.keys),
            }
        }
    }
}

pub struct WriteJob {
    pub(crate) key:          String,
    pub(crate) sql:          Arc<dyn SqlStore>,
    pub(crate) remote:       Arc<dyn RemoteStore>,
    pub(crate) update:       Update,
    pub(crate) compensation: Compensation,
    pub(crate) lock:         LockGuard,
    pub(crate) observer:     Option<Arc<dyn CacheObserver>>,
}

impl WriteJob {
    pub(crate) async fn run(self) {
        let Self {
            key,
            sql,
            remote,
            update,
            compensation,
            lock,
            observer,
        } = self;

        match sql.update(&update).await {
            Ok(rows) => debug!("deferred write for {key} done; rows={rows}"),
            Err(source) => {
                let err = Error::AsyncWriteFailed {
                    key: key.clone(),
                    source,
                };
                warn!("{err}; {update}");
                compensation.apply(remote.as_ref()).await;
                if let Some(observer) = observer {
                    observer.on_async_write_failed(&key, &err).await;
                    observer.on_error("write_through", &err).await;
                }
            }
        }
        lock.release().await;
    }
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteJob")
            .field("key", &self.key)
            .field("update", &self.update.to_string())
            .finish_non_exhaustive()
    }
}

struct Shared {
    pending: AtomicUsize,
    idle:    Notify,
}

impl Shared {
    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A pool of tokio tasks draining a queue of [`WriteJob`]s.
pub struct AsyncExecutor {
    sender:  Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared:  Arc<Shared>,
}

impl AsyncExecutor {
    /// Spawns `workers` tasks on the current runtime.
    pub fn new(workers: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<WriteJob>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            idle:    Notify::new(),
        });

        let handles = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job
                        else {
                            break;
                        };
                        job.run().await;
                        shared.done();
                    }
                    debug!("write worker {id} stopped");
                })
            })
            .collect();

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shared,
        })
    }

    /// Queue a job. Once the executor is closed the job is handed back.
    pub fn submit(&self, job: WriteJob) -> Result<(), WriteJob> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref()
        else {
            return Err(job);
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(job).map_err(|e| {
            self.shared.done();
            e.0
        })
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Resolves once every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, finish the queued ones and stop the workers.
    pub async fn close(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("write worker failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("pending", &self.pending())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::MemorySqlStore;
    use crate::backend::MemoryStore;
    use crate::sql::Assign;
    use crate::sql::Filter;

    #[derive(Debug, Default)]
    struct Failures(Mutex<Vec<String>>);

    #[async_trait]
    impl CacheObserver for Failures {
        async fn on_async_write_failed(&self, key: &str, error: &Error) {
            if let Error::AsyncWriteFailed { key: failed, .. } = error {
                assert_eq!(failed, key);
                self.0.lock().push(key.to_string());
            }
        }
    }

    #[tokio::test]
    async fn failed_job_reports_async_write_failure() {
        let sql = Arc::new(MemorySqlStore::new());
        sql.fail_updates(true);
        let failures = Arc::new(Failures::default());
        let observer: Arc<dyn CacheObserver> = failures.clone();
        let executor = AsyncExecutor::new(1);

        let job = WriteJob {
            key: "mrr_t_1".into(),
            sql,
            remote: Arc::new(MemoryStore::new()),
            update: Update {
                table:       "t".into(),
                assignments: vec![("age".into(), Assign::Add(1.into()))],
                filter:      Filter::default(),
            },
            compensation: Compensation::key("mrr_t_1"),
            lock: LockGuard::noop("mrr_t_1_lock_save".into()),
            observer: Some(observer),
        };
        assert!(executor.submit(job).is_ok());
        executor.wait_idle().await;

        assert_eq!(*failures.0.lock(), vec!["mrr_t_1".to_string()]);
        executor.close().await;
    }
}
