/**
 * Debounced subscription changes for reactive watchers
 *
 * UI code that derives its subscriptions from reactive state (the selected
 * wallet, the visible chain) can flip them several times in quick succession.
 * Each watched key runs `Stable -> PendingChange -> Applied` with its own
 * timer, so only the last desired state in a quiet period reaches the
 * registry.
 */
use super::data_type::DataType;
use super::subscription::{FilterParams, SubscriptionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Stable,
    PendingChange,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Demand {
    data_type: DataType,
    params: Option<FilterParams>,
}

#[derive(Debug)]
struct WatchedKey {
    phase: WatchPhase,
    desired: Option<Demand>,
    applied: Option<(Demand, String)>,
    generation: u64,
    timer: CancellationToken,
}

#[derive(Debug, Default)]
struct DebounceState {
    keys: HashMap<String, WatchedKey>,
    next_generation: u64,
}

#[derive(Debug)]
struct Inner {
    registry: Arc<SubscriptionRegistry>,
    subscriber_id: String,
    delay: Duration,
    state: RwLock<DebounceState>,
}

/// Debounced subscribe/unsubscribe on behalf of one subscriber.
#[derive(Debug, Clone)]
pub struct DebouncedSubscriptions {
    inner: Arc<Inner>,
}

impl DebouncedSubscriptions {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, subscriber_id: &str, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                subscriber_id: subscriber_id.to_string(),
                delay,
                state: RwLock::new(DebounceState::default()),
            }),
        }
    }

    /// Requests that `key` be subscribed to `data_type` once the watcher has
    /// been quiet for the debounce delay.
    pub async fn want(&self, key: &str, data_type: DataType, params: Option<FilterParams>) {
        self.schedule(key, Some(Demand { data_type, params })).await;
    }

    /// Requests that `key` be unsubscribed once the watcher has been quiet.
    pub async fn release(&self, key: &str) {
        self.schedule(key, None).await;
    }

    async fn schedule(&self, key: &str, desired: Option<Demand>) {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;

        let generation = state.next_generation;
        state.next_generation += 1;

        let entry = state.keys.entry(key.to_string()).or_insert_with(|| WatchedKey {
            phase: WatchPhase::Stable,
            desired: None,
            applied: None,
            generation,
            timer: CancellationToken::new(),
        });
        entry.timer.cancel();
        entry.desired = desired;
        entry.generation = generation;
        entry.phase = WatchPhase::PendingChange;
        entry.timer = CancellationToken::new();

        let token = entry.timer.clone();
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep(inner.delay) => {
                    Self::apply(&inner, &key, Some(generation)).await;
                }
            }
        });
        drop(guard);
    }

    /// Reconciles the registry with the desired state of `key`. With a
    /// generation, only applies if no newer change arrived meanwhile.
    #[allow(clippy::significant_drop_tightening)]
    async fn apply(inner: &Inner, key: &str, generation: Option<u64>) {
        let mut state = inner.state.write().await;
        let Some(entry) = state.keys.get_mut(key) else {
            return;
        };
        if entry.phase != WatchPhase::PendingChange
            || generation.is_some_and(|g| g != entry.generation)
        {
            return;
        }
        entry.timer.cancel();

        let unchanged = entry.applied.as_ref().map(|(demand, _)| demand) == entry.desired.as_ref();
        if !unchanged {
            // subscribe before releasing the old one so a scope change on the
            // same data type never drops its ref count to zero
            let previous = entry.applied.take();
            if let Some(demand) = entry.desired.clone() {
                let id = inner
                    .registry
                    .subscribe(&inner.subscriber_id, demand.data_type.clone(), demand.params.clone())
                    .await;
                entry.applied = Some((demand, id));
            }
            if let Some((_, id)) = previous {
                inner.registry.unsubscribe(&id).await;
            }
            debug!("🔁 Applied debounced change for {}:{}", inner.subscriber_id, key);
        }
        entry.phase = WatchPhase::Applied;

        if entry.applied.is_none() {
            state.keys.remove(key);
        }
    }

    /// Applies every pending change immediately.
    pub async fn flush(&self) {
        let pending: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .keys
                .iter()
                .filter(|(_, k)| k.phase == WatchPhase::PendingChange)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in pending {
            Self::apply(&self.inner, &key, None).await;
        }
    }

    /// Releases every key and applies the result right away.
    pub async fn release_all(&self) {
        let keys: Vec<String> = self.inner.state.read().await.keys.keys().cloned().collect();
        for key in &keys {
            self.release(key).await;
        }
        self.flush().await;
    }

    /// Keys that were never watched, or were released and applied, are `Stable`.
    pub async fn phase(&self, key: &str) -> WatchPhase {
        self.inner
            .state
            .read()
            .await
            .keys
            .get(key)
            .map_or(WatchPhase::Stable, |k| k.phase)
    }

    pub async fn subscription_id(&self, key: &str) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .keys
            .get(key)
            .and_then(|k| k.applied.as_ref().map(|(_, id)| id.clone()))
    }
}
