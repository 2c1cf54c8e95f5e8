use super::config::{DEFAULT_MAX_LOADING_MS, LOADING_CLEANUP_DELAY_MS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error attached to a loading state whose max duration elapsed
pub const LOADING_TIMEOUT_MESSAGE: &str = "Loading timeout";

/// Anti-flicker timing for one loading id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingOptions {
    /// Earliest completion, measured from `start_loading`
    pub min_loading_time_ms: u64,
    /// Forced timeout; zero disables it
    pub max_loading_time_ms: u64,
    pub show_progress: bool,
}

impl Default for LoadingOptions {
    fn default() -> Self {
        Self {
            min_loading_time_ms: 0,
            max_loading_time_ms: DEFAULT_MAX_LOADING_MS,
            show_progress: false,
        }
    }
}

impl LoadingOptions {
    #[must_use]
    pub fn min_loading_time(mut self, min: Duration) -> Self {
        self.min_loading_time_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn max_loading_time(mut self, max: Duration) -> Self {
        self.max_loading_time_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub const fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    const fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_loading_time_ms)
    }

    const fn max_duration(&self) -> Option<Duration> {
        if self.max_loading_time_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_loading_time_ms))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingState {
    pub id: String,
    pub is_loading: bool,
    pub loading_text: Option<String>,
    /// Percentage, only present when the entry was started with progress
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub last_updated: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingPhase {
    Loading,
    Succeeded,
    Failed,
}

impl LoadingState {
    #[must_use]
    pub const fn phase(&self) -> LoadingPhase {
        match (self.is_loading, &self.error) {
            (true, _) => LoadingPhase::Loading,
            (false, None) => LoadingPhase::Succeeded,
            (false, Some(_)) => LoadingPhase::Failed,
        }
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.error.as_deref() == Some(LOADING_TIMEOUT_MESSAGE)
    }
}

struct LoadingEntry {
    state: LoadingState,
    options: LoadingOptions,
    started_at: Instant,
    generation: u64,
    stopping: bool,
    /// Cancels every timer belonging to this generation
    cancel: CancellationToken,
    max_timer: CancellationToken,
}

#[derive(Default)]
struct TrackerState {
    entries: HashMap<String, LoadingEntry>,
    channels: HashMap<String, watch::Sender<Option<LoadingState>>>,
    next_generation: u64,
}

impl TrackerState {
    fn publish(&mut self, id: &str, state: Option<LoadingState>) {
        if let Some(tx) = self.channels.get(id) {
            let idle = state.is_none();
            tx.send_replace(state);
            if idle && tx.receiver_count() == 0 {
                self.channels.remove(id);
            }
        }
    }
}

/// Per-id loading, progress and error state with anti-flicker timing.
///
/// `Idle -> Loading -> (progress)* -> Finalized -> Idle`. Finalized states stay
/// readable for the cleanup delay so late observers see the outcome.
pub struct LoadingStateTracker {
    state: Arc<RwLock<TrackerState>>,
    cleanup_delay: Duration,
}

impl std::fmt::Debug for LoadingStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingStateTracker")
            .field("cleanup_delay", &self.cleanup_delay)
            .finish_non_exhaustive()
    }
}

impl Default for LoadingStateTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(LOADING_CLEANUP_DELAY_MS))
    }
}

impl LoadingStateTracker {
    #[must_use]
    pub fn new(cleanup_delay: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(TrackerState::default())),
            cleanup_delay,
        }
    }

    /// Starts (or restarts) loading for `id` and arms the timeout.
    pub async fn start_loading(&self, id: &str, text: Option<&str>, options: LoadingOptions) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(previous) = state.entries.remove(id) {
            previous.cancel.cancel();
            debug!("♻️  Restarting loading entry {}", id);
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let now = Instant::now();
        let loading = LoadingState {
            id: id.to_string(),
            is_loading: true,
            loading_text: text.map(str::to_string),
            progress: options.show_progress.then_some(0),
            error: None,
            last_updated: now,
        };

        let cancel = CancellationToken::new();
        let max_timer = cancel.child_token();
        if let Some(max) = options.max_duration() {
            tokio::spawn(Self::run_max_timer(
                Arc::clone(&self.state),
                id.to_string(),
                generation,
                max,
                max_timer.clone(),
                self.cleanup_delay,
            ));
        }

        state.entries.insert(
            id.to_string(),
            LoadingEntry {
                state: loading.clone(),
                options,
                started_at: now,
                generation,
                stopping: false,
                cancel,
                max_timer,
            },
        );
        state.publish(id, Some(loading));
        drop(guard);

        debug!("⏳ Loading started: {}", id);
    }

    /// Updates progress (clamped to 100) and optionally the text of an id
    /// that is still loading.
    pub async fn update_progress(&self, id: &str, progress: u8, text: Option<&str>) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(id).filter(|e| e.state.is_loading) else {
            debug!("Progress update for idle loading id {}", id);
            return;
        };

        entry.state.progress = Some(progress.min(100));
        if let Some(text) = text {
            entry.state.loading_text = Some(text.to_string());
        }
        entry.state.last_updated = Instant::now();
        let snapshot = entry.state.clone();
        state.publish(id, Some(snapshot));
    }

    /// Finishes loading for `id`, deferring until the minimum loading time
    /// has elapsed since `start_loading`. Idle or already-stopping ids are a
    /// no-op.
    pub async fn stop_loading(&self, id: &str, error: Option<String>) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(id) else {
            debug!("Stop for unknown loading id {}", id);
            return;
        };
        if !entry.state.is_loading || entry.stopping {
            return;
        }

        let elapsed = entry.started_at.elapsed();
        let min = entry.options.min_duration();
        if elapsed < min {
            entry.stopping = true;
            let remaining = min - elapsed;
            debug!("⏳ Deferring stop of {} by {:?}", id, remaining);
            tokio::spawn(Self::run_deferred_stop(
                Arc::clone(&self.state),
                id.to_string(),
                entry.generation,
                remaining,
                error,
                entry.cancel.clone(),
                self.cleanup_delay,
            ));
            return;
        }

        let generation = entry.generation;
        Self::finalize(state, &self.state, id, generation, error, self.cleanup_delay);
    }

    fn finalize(
        state: &mut TrackerState,
        shared: &Arc<RwLock<TrackerState>>,
        id: &str,
        generation: u64,
        error: Option<String>,
        cleanup_delay: Duration,
    ) {
        let Some(entry) = state
            .entries
            .get_mut(id)
            .filter(|e| e.generation == generation && e.state.is_loading)
        else {
            return;
        };

        entry.max_timer.cancel();
        entry.stopping = false;
        entry.state.is_loading = false;
        if error.is_none() {
            entry.state.progress = entry.state.progress.map(|_| 100);
        }
        match &error {
            Some(e) => warn!("❌ Loading failed: {} - {}", id, e),
            None => debug!("✅ Loading finished: {} ({:.2}s)", id, entry.started_at.elapsed().as_secs_f64()),
        }
        entry.state.error = error;
        entry.state.last_updated = Instant::now();

        let snapshot = entry.state.clone();
        tokio::spawn(Self::run_cleanup(
            Arc::clone(shared),
            id.to_string(),
            generation,
            cleanup_delay,
            entry.cancel.clone(),
        ));
        state.publish(id, Some(snapshot));
    }

    async fn run_max_timer(
        shared: Arc<RwLock<TrackerState>>,
        id: String,
        generation: u64,
        max: Duration,
        token: CancellationToken,
        cleanup_delay: Duration,
    ) {
        tokio::select! {
            () = token.cancelled() => {}
            () = sleep(max) => {
                info!("⌛ Loading timed out: {} after {:?}", id, max);
                let mut state = shared.write().await;
                Self::finalize(
                    &mut state,
                    &shared,
                    &id,
                    generation,
                    Some(LOADING_TIMEOUT_MESSAGE.to_string()),
                    cleanup_delay,
                );
            }
        }
    }

    async fn run_deferred_stop(
        shared: Arc<RwLock<TrackerState>>,
        id: String,
        generation: u64,
        delay: Duration,
        error: Option<String>,
        token: CancellationToken,
        cleanup_delay: Duration,
    ) {
        tokio::select! {
            () = token.cancelled() => {}
            () = sleep(delay) => {
                let mut state = shared.write().await;
                Self::finalize(&mut state, &shared, &id, generation, error, cleanup_delay);
            }
        }
    }

    async fn run_cleanup(
        shared: Arc<RwLock<TrackerState>>,
        id: String,
        generation: u64,
        delay: Duration,
        token: CancellationToken,
    ) {
        tokio::select! {
            () = token.cancelled() => {}
            () = sleep(delay) => {
                let mut guard = shared.write().await;
                let state = &mut *guard;
                let current = state
                    .entries
                    .get(&id)
                    .is_some_and(|e| e.generation == generation && !e.state.is_loading);
                if current {
                    state.entries.remove(&id);
                    state.publish(&id, None);
                    debug!("🧹 Loading state purged: {}", id);
                }
            }
        }
    }

    /// Watches one id. The receiver holds `None` while the id is idle;
    /// dropping it unsubscribes.
    pub async fn subscribe(&self, id: &str) -> watch::Receiver<Option<LoadingState>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let current = state.entries.get(id).map(|e| e.state.clone());
        state
            .channels
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    pub async fn get_state(&self, id: &str) -> Option<LoadingState> {
        self.state.read().await.entries.get(id).map(|e| e.state.clone())
    }

    pub async fn is_loading(&self, id: &str) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .is_some_and(|e| e.state.is_loading)
    }

    pub async fn get_active_states(&self) -> Vec<LoadingState> {
        let state = self.state.read().await;
        let mut active: Vec<LoadingState> = state
            .entries
            .values()
            .filter(|e| e.state.is_loading)
            .map(|e| e.state.clone())
            .collect();
        drop(state);
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Cancels every timer and returns all ids to idle.
    pub async fn clear_all(&self) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let cleared = state.entries.len();
        for (id, entry) in state.entries.drain() {
            entry.cancel.cancel();
            if let Some(tx) = state.channels.get(&id) {
                tx.send_replace(None);
            }
        }
        state.channels.retain(|_, tx| tx.receiver_count() > 0);
        drop(guard);
        info!("🧹 Cleared {} loading states", cleared);
    }
}
