use super::config::DEFAULT_CACHE_TTL_MS;
use crate::error::{Error, FetchFailure, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type CachedValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, core::result::Result<CachedValue, FetchFailure>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub ttl: Duration,
    pub priority: RequestPriority,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::with_ttl(Duration::from_millis(DEFAULT_CACHE_TTL_MS))
    }
}

impl RequestOptions {
    #[must_use]
    pub const fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            priority: RequestPriority::Normal,
        }
    }

    #[must_use]
    pub const fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

struct CacheEntry {
    value: CachedValue,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

struct PendingFetch {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    coalesced: u64,
    fetches: u64,
    failures: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingFetch>,
    next_generation: u64,
    counters: CacheCounters,
}

/// In-flight deduplication plus TTL caching keyed by opaque strings.
///
/// Values are stored type-erased so one cache can serve every collaborator;
/// asking for a key with a different type than it holds is an
/// `Error::TypeMismatch`.
pub struct RequestCache {
    state: Arc<RwLock<CacheState>>,
    default_ttl: Duration,
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CACHE_TTL_MS))
    }
}

impl RequestCache {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            default_ttl,
        }
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the value for `key`, invoking `fetch` only when there is
    /// neither an in-flight request nor a fresh entry for it.
    ///
    /// Concurrent callers for the same key share one fetch and one outcome.
    /// Failures are never cached. The fetch runs on its own task, so it
    /// completes and populates the cache even if every caller goes away.
    ///
    /// # Errors
    ///
    /// Returns `Error::Fetch` when the shared fetch fails and
    /// `Error::TypeMismatch` when the key holds a value of another type.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn request<T, F, Fut, E>(&self, key: &str, fetch: F, options: RequestOptions) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = core::result::Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let shared = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            if let Some(pending) = state.pending.get(key) {
                state.counters.coalesced += 1;
                debug!("🔗 Request COALESCED: {} (priority: {:?})", key, options.priority);
                pending.fetch.clone()
            } else if let Some(entry) = state.entries.get(key).filter(|e| e.is_fresh(options.ttl)) {
                state.counters.hits += 1;
                debug!("🎯 Cache HIT: {}", key);
                return downcast(key, entry.value.clone());
            } else {
                state.counters.misses += 1;
                state.counters.fetches += 1;
                let generation = state.next_generation;
                state.next_generation += 1;

                debug!("🔄 FETCH START: {} (priority: {:?})", key, options.priority);
                let fetch = self.dispatch(key.to_string(), generation, fetch());
                state.pending.insert(
                    key.to_string(),
                    PendingFetch {
                        generation,
                        fetch: fetch.clone(),
                    },
                );
                fetch
            }
        };

        let value = shared.await?;
        downcast(key, value)
    }

    fn dispatch<T, Fut, E>(&self, key: String, generation: u64, fetch: Fut) -> SharedFetch
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let outcome = fetch.await;
            let elapsed = start.elapsed();

            let mut guard = state.write().await;
            let state = &mut *guard;
            let current = state
                .pending
                .get(&task_key)
                .is_some_and(|p| p.generation == generation);
            if current {
                state.pending.remove(&task_key);
            }

            match outcome {
                Ok(value) => {
                    let value: CachedValue = Arc::new(value);
                    if current {
                        info!("💾 Cache STORE: {} ({:.2}s)", task_key, elapsed.as_secs_f64());
                        state.entries.insert(
                            task_key,
                            CacheEntry {
                                value: Arc::clone(&value),
                                stored_at: Instant::now(),
                            },
                        );
                    } else {
                        debug!("🗑️  Discarding result for cleared key: {}", task_key);
                    }
                    Ok(value)
                }
                Err(e) => {
                    state.counters.failures += 1;
                    warn!("❌ FETCH FAILED: {} ({:.2}s) - {}", task_key, elapsed.as_secs_f64(), e);
                    Err(FetchFailure::new(task_key, e.to_string()))
                }
            }
        });

        let state = Arc::clone(&self.state);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let mut guard = state.write().await;
                    if guard
                        .pending
                        .get(&key)
                        .is_some_and(|p| p.generation == generation)
                    {
                        guard.pending.remove(&key);
                    }
                    guard.counters.failures += 1;
                    drop(guard);
                    warn!("💀 FETCH ABORTED: {} - {}", key, join_error);
                    Err(FetchFailure::new(key, format!("fetch task aborted: {join_error}")))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Returns a fresh cached value without fetching.
    ///
    /// # Errors
    ///
    /// Returns `Error::TypeMismatch` when the key holds a value of another type.
    pub async fn get_cached<T>(&self, key: &str, ttl: Option<Duration>) -> Result<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let value = {
            let state = self.state.read().await;
            state
                .entries
                .get(key)
                .filter(|e| e.is_fresh(ttl))
                .map(|e| Arc::clone(&e.value))
        };
        value.map(|v| downcast(key, v)).transpose()
    }

    pub async fn is_cached(&self, key: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.state
            .read()
            .await
            .entries
            .get(key)
            .is_some_and(|e| e.is_fresh(ttl))
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        self.state.read().await.pending.contains_key(key)
    }

    /// Drops the entry and any pending marker for `key`. A fetch still in
    /// flight for it finishes for its current awaiters but is not cached.
    pub async fn clear_cache(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        let had_entry = state.entries.remove(key).is_some();
        let had_pending = state.pending.remove(key).is_some();
        drop(state);
        if had_entry || had_pending {
            debug!("🧹 Cache CLEAR: {}", key);
        }
        had_entry || had_pending
    }

    pub async fn clear_all_cache(&self) {
        let mut state = self.state.write().await;
        let cleared = state.entries.len();
        state.entries.clear();
        state.pending.clear();
        drop(state);
        info!("🧹 Cache cleared ({} entries)", cleared);
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn get_cache_stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state.entries.keys().cloned().collect();
        keys.sort();

        CacheStats {
            total_entries: state.entries.len(),
            pending_requests: state.pending.len(),
            keys,
            hits: state.counters.hits,
            misses: state.counters.misses,
            coalesced: state.counters.coalesced,
            fetches: state.counters.fetches,
            failures: state.counters.failures,
        }
    }
}

fn downcast<T: Send + Sync + 'static>(key: &str, value: CachedValue) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| Error::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub pending_requests: usize,
    pub keys: Vec<String>,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub fetches: u64,
    pub failures: u64,
}

impl CacheStats {
    /// Share of requests served without starting a fetch (0.0 to 1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.coalesced;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
