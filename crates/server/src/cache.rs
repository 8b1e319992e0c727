//! In-memory deduplicating result cache.
//!
//! [`DedupCache::get_or_run`] guarantees at most one concurrent execution of
//! the work for a key. Callers arriving while the work runs wait for its
//! outcome; successful results are then served from memory until their TTL
//! passes. Failures are never cached. A background sweeper removes expired
//! results and runs an optional [`EvictionHook`] on each of them.
//!
//! The entry map sits behind one mutex that is held only for lookups,
//! insertions and removals, never while work or cleanup runs.

use crate::metrics::{
    CACHE_CLEANUP_FAILURES, CACHE_ENTRIES, CACHE_EVICTIONS, CACHE_HITS, CACHE_JOINS, CACHE_MISSES,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors returned to [`DedupCache::get_or_run`] callers.
///
/// Cloneable so every waiter of one execution receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The work function failed. Carries its rendered error.
    #[error("{0}")]
    Upstream(String),

    /// This caller's cancellation token fired before the outcome was ready.
    /// Other waiters and the work itself are unaffected.
    #[error("request cancelled")]
    Cancelled,

    /// The work task panicked or was torn down without producing a result.
    #[error("work aborted: {0}")]
    Aborted(String),
}

/// Error type returned by eviction hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Side-effect cleanup run for each expired result the sweeper removes.
#[async_trait]
pub trait EvictionHook<T>: Send + Sync {
    async fn on_evict(&self, key: &str, value: &T) -> Result<(), HookError>;
}

type Outcome<T> = Result<T, CacheError>;

/// Clears the in-progress entry if the work task is dropped before it settles.
struct AbandonGuard<T: Clone + Send + Sync + 'static> {
    cache: DedupCache<T>,
    key: String,
    rx: watch::Receiver<Option<Outcome<T>>>,
    armed: bool,
}

impl<T: Clone + Send + Sync + 'static> AbandonGuard<T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for AbandonGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.discard_abandoned(&self.key, &self.rx);
        }
    }
}

enum Slot<T> {
    InProgress(watch::Receiver<Option<Outcome<T>>>),
    Ready { value: T, expires_at: Instant },
}

struct Inner<T> {
    entries: Mutex<HashMap<String, Slot<T>>>,
    ttl: Duration,
    hook: Option<Arc<dyn EvictionHook<T>>>,
    shutdown: CancellationToken,
}

/// Deduplicating cache keyed by request fingerprint. Cheap to clone.
pub struct DedupCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DedupCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> DedupCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache whose results live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self::build(ttl, None)
    }

    /// Create a cache that runs `hook` for every expired result it evicts.
    pub fn with_eviction_hook(ttl: Duration, hook: Arc<dyn EvictionHook<T>>) -> Self {
        Self::build(ttl, Some(hook))
    }

    fn build(ttl: Duration, hook: Option<Arc<dyn EvictionHook<T>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl,
                hook,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Number of entries, in progress or ready.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached result for `key`, or run `work` to produce it.
    ///
    /// Uses the cache's configured TTL. See [`DedupCache::get_or_run_with_ttl`].
    pub async fn get_or_run<F, Fut, E>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.get_or_run_with_ttl(key, self.inner.ttl, cancel, work)
            .await
    }

    /// Return the cached result for `key`, or run `work` to produce it.
    ///
    /// The first caller for a key spawns `work` on its own task, handing it
    /// `cancel`. Concurrent callers wait for that execution and receive the
    /// same outcome. If a caller's `cancel` fires while it waits, that caller
    /// alone gets [`CacheError::Cancelled`]; the execution keeps running and
    /// still settles the entry for everyone else.
    pub async fn get_or_run_with_ttl<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut rx = {
            let mut entries = self.lock();
            match entries.get(key) {
                Some(Slot::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                    CACHE_HITS.inc();
                    tracing::debug!(key, "Cache hit");
                    return Ok(value.clone());
                }
                Some(Slot::InProgress(rx)) => {
                    CACHE_JOINS.inc();
                    tracing::debug!(key, "Joining in-progress execution");
                    rx.clone()
                }
                _ => {
                    CACHE_MISSES.inc();
                    let (tx, rx) = watch::channel(None);
                    let replaced =
                        entries.insert(key.to_string(), Slot::InProgress(rx.clone()));
                    CACHE_ENTRIES.set(entries.len() as i64);
                    drop(entries);

                    if let Some(Slot::Ready { value, .. }) = replaced {
                        self.spawn_cleanup(key.to_string(), value);
                    }
                    self.spawn_work(key.to_string(), ttl, tx, cancel.clone(), work);
                    rx
                }
            }
        };

        tokio::select! {
            biased;
            outcome = async { rx.wait_for(Option::is_some).await.map(|o| (*o).clone()) } => {
                match outcome {
                    Ok(Some(outcome)) => outcome,
                    _ => {
                        self.discard_abandoned(key, &rx);
                        Err(CacheError::Aborted("work ended without a result".to_string()))
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!(key, "Caller cancelled while waiting for result");
                Err(CacheError::Cancelled)
            }
        }
    }

    fn spawn_work<F, Fut, E>(
        &self,
        key: String,
        ttl: Duration,
        tx: watch::Sender<Option<Outcome<T>>>,
        cancel: CancellationToken,
        work: F,
    ) where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let cache = self.clone();
        let mut guard = AbandonGuard {
            cache: self.clone(),
            key: key.clone(),
            rx: tx.subscribe(),
            armed: true,
        };
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(async move { work(cancel).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CacheError::Upstream(e.to_string())),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(key = %key, reason = %reason, "Cache work panicked");
                    Err(CacheError::Aborted(reason))
                }
            };
            cache.settle(&key, ttl, &outcome);
            guard.disarm();
            tx.send_replace(Some(outcome));
        });
    }

    /// Drop `key` if it is still the in-progress entry behind `rx`.
    fn discard_abandoned(&self, key: &str, rx: &watch::Receiver<Option<Outcome<T>>>) {
        let mut entries = self.lock();
        if matches!(entries.get(key), Some(Slot::InProgress(current)) if current.same_channel(rx)) {
            entries.remove(key);
            CACHE_ENTRIES.set(entries.len() as i64);
            tracing::warn!(key, "Work torn down without a result, entry dropped");
        }
    }

    /// Move an in-progress entry to its terminal state: ready on success,
    /// removed on failure. Runs before waiters are signalled, so a waiter
    /// that retries after an error never finds the failed execution.
    fn settle(&self, key: &str, ttl: Duration, outcome: &Outcome<T>) {
        let mut entries = self.lock();
        if !matches!(entries.get(key), Some(Slot::InProgress(_))) {
            return;
        }
        match outcome {
            Ok(value) => {
                entries.insert(
                    key.to_string(),
                    Slot::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
            }
            Err(e) => {
                entries.remove(key);
                tracing::debug!(key, error = %e, "Work failed, entry dropped");
            }
        }
        CACHE_ENTRIES.set(entries.len() as i64);
    }

    fn spawn_cleanup(&self, key: String, value: T) {
        let Some(hook) = self.inner.hook.clone() else {
            return;
        };
        tokio::spawn(async move {
            run_hook(hook.as_ref(), &key, &value).await;
        });
    }

    /// Remove every expired ready entry and run the eviction hook on each.
    ///
    /// In-progress entries are never touched. Hook failures are logged and
    /// do not affect other entries. Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<(String, T)> = {
            let mut entries = self.lock();
            let now = Instant::now();
            let expired = entries
                .extract_if(|_, slot| {
                    matches!(slot, Slot::Ready { expires_at, .. } if *expires_at <= now)
                })
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { value, .. } => Some((key, value)),
                    Slot::InProgress(_) => None,
                })
                .collect();
            CACHE_ENTRIES.set(entries.len() as i64);
            expired
        };

        if expired.is_empty() {
            return 0;
        }
        CACHE_EVICTIONS.inc_by(expired.len() as u64);

        if let Some(hook) = &self.inner.hook {
            futures::future::join_all(
                expired
                    .iter()
                    .map(|(key, value)| run_hook(hook.as_ref(), key, value)),
            )
            .await;
        }
        expired.len()
    }

    /// Spawn the background sweeper. It runs every `interval` until [`DedupCache::stop`].
    pub fn start_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.sweep().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "Cache sweep evicted expired entries");
                        }
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    /// Stop the background sweeper. In-progress executions are unaffected.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_hook<T: Sync>(hook: &dyn EvictionHook<T>, key: &str, value: &T) {
    if let Err(e) = hook.on_evict(key, value).await {
        CACHE_CLEANUP_FAILURES.inc();
        tracing::error!(key, error = %e, "Eviction cleanup failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
