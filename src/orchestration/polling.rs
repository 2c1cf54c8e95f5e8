use super::visibility::{Visibility, VisibilitySource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work performed on every tick of a poll task.
#[async_trait]
pub trait PollCallback: Send + Sync {
    async fn tick(&self) -> Result<()>;
}

#[async_trait]
impl<F, Fut> PollCallback for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn tick(&self) -> Result<()> {
        (self)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub active_interval: Duration,
    pub background_interval: Duration,
    /// Switch to `background_interval` while the host is hidden. Ticks keep
    /// running at the slower cadence; they are not suspended.
    pub pause_on_hidden: bool,
    /// Replace a task already registered under the same id instead of
    /// rejecting the registration.
    pub replace_existing: bool,
}

impl PollOptions {
    #[must_use]
    pub const fn new(active_interval: Duration, background_interval: Duration) -> Self {
        Self {
            active_interval,
            background_interval,
            pause_on_hidden: true,
            replace_existing: true,
        }
    }

    #[must_use]
    pub const fn pause_on_hidden(mut self, pause_on_hidden: bool) -> Self {
        self.pause_on_hidden = pause_on_hidden;
        self
    }

    #[must_use]
    pub const fn replace_existing(mut self, replace_existing: bool) -> Self {
        self.replace_existing = replace_existing;
        self
    }

    #[must_use]
    pub const fn interval_for(&self, visibility: Visibility) -> Duration {
        match (visibility, self.pause_on_hidden) {
            (Visibility::Background, true) => self.background_interval,
            _ => self.active_interval,
        }
    }
}

#[derive(Debug, Default)]
struct TaskCounters {
    ticks: AtomicU64,
    failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

struct PollTask {
    callback: Arc<dyn PollCallback>,
    options: PollOptions,
    paused: bool,
    interval: Duration,
    timer: CancellationToken,
    counters: Arc<TaskCounters>,
    registered_at: Instant,
}

impl PollTask {
    fn start_timer(&mut self, id: &str, shutdown: &CancellationToken) {
        self.timer.cancel();
        let token = shutdown.child_token();
        self.timer = token.clone();
        tokio::spawn(run_timer(
            id.to_string(),
            Arc::clone(&self.callback),
            Arc::clone(&self.counters),
            self.interval,
            token,
        ));
    }

    fn stop_timer(&self) {
        self.timer.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub id: String,
    pub interval: Duration,
    pub paused: bool,
    pub pause_on_hidden: bool,
    pub ticks: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub registered_for: Duration,
}

/// Named recurring tasks whose cadence follows host visibility.
///
/// One listener on the `VisibilitySource` restarts every running timer when
/// the host moves between foreground and background.
pub struct PollingScheduler {
    tasks: Arc<RwLock<HashMap<String, PollTask>>>,
    visibility: Arc<dyn VisibilitySource>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("visibility", &self.visibility.current())
            .finish_non_exhaustive()
    }
}

impl PollingScheduler {
    /// Creates the scheduler and spawns its visibility listener. Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn start(visibility: Arc<dyn VisibilitySource>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            visibility: Arc::clone(&visibility),
            shutdown: CancellationToken::new(),
        });

        let tasks = Arc::clone(&scheduler.tasks);
        let shutdown = scheduler.shutdown.clone();
        let mut changes = visibility.changes();
        tokio::spawn(async move {
            debug!("👁️  Visibility listener started");
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            debug!("👁️  Visibility source dropped, listener exiting");
                            break;
                        }
                        let visibility = *changes.borrow_and_update();
                        Self::apply_visibility(&tasks, visibility, &shutdown).await;
                    }
                }
            }
        });

        scheduler
    }

    async fn apply_visibility(
        tasks: &RwLock<HashMap<String, PollTask>>,
        visibility: Visibility,
        shutdown: &CancellationToken,
    ) {
        let mut tasks = tasks.write().await;
        let mut restarted = 0;
        for (id, task) in tasks.iter_mut().filter(|(_, t)| !t.paused) {
            task.interval = task.options.interval_for(visibility);
            task.start_timer(id, shutdown);
            restarted += 1;
        }
        drop(tasks);
        info!("👁️  Visibility {:?}: restarted {} poll timers", visibility, restarted);
    }

    fn validate(id: &str, options: &PollOptions) -> Result<()> {
        if options.active_interval.is_zero() {
            return Err(Error::InvalidInterval(format!("{id}: active interval is zero")));
        }
        if options.pause_on_hidden && options.background_interval.is_zero() {
            return Err(Error::InvalidInterval(format!("{id}: background interval is zero")));
        }
        Ok(())
    }

    /// Registers `callback` under `id` and starts its timer at the interval
    /// matching current visibility. The first tick fires one interval later.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskExists` if `id` is taken and
    /// `options.replace_existing` is false, `Error::InvalidInterval` for
    /// zero-length intervals and `Error::SchedulerStopped` once `shutdown`
    /// has run.
    pub async fn register<C>(&self, id: &str, callback: C, options: PollOptions) -> Result<()>
    where
        C: PollCallback + 'static,
    {
        Self::validate(id, &options)?;

        let mut tasks = self.tasks.write().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::SchedulerStopped);
        }
        if let Some(existing) = tasks.get(id) {
            if !options.replace_existing {
                return Err(Error::TaskExists(id.to_string()));
            }
            existing.stop_timer();
            debug!("♻️  Replacing poll task {}", id);
        }

        let interval = options.interval_for(self.visibility.current());
        let mut task = PollTask {
            callback: Arc::new(callback),
            options,
            paused: false,
            interval,
            timer: CancellationToken::new(),
            counters: Arc::default(),
            registered_at: Instant::now(),
        };
        task.start_timer(id, &self.shutdown);
        tasks.insert(id.to_string(), task);
        drop(tasks);

        info!("📅 Poll task registered: {} (every {:?})", id, interval);
        Ok(())
    }

    /// Stops and forgets the task. Unknown ids are a no-op.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.tasks.write().await.remove(id);
        removed.is_some_and(|task| {
            task.stop_timer();
            info!("🗑️  Poll task unregistered: {}", id);
            true
        })
    }

    pub async fn pause(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if !task.paused => {
                task.stop_timer();
                task.paused = true;
                debug!("⏸️  Poll task paused: {}", id);
                true
            }
            _ => false,
        }
    }

    pub async fn resume(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        let visibility = self.visibility.current();
        match tasks.get_mut(id) {
            Some(task) if task.paused => {
                task.paused = false;
                task.interval = task.options.interval_for(visibility);
                task.start_timer(id, &self.shutdown);
                debug!("▶️  Poll task resumed: {}", id);
                true
            }
            _ => false,
        }
    }

    pub async fn pause_all(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut paused = 0;
        for task in tasks.values_mut().filter(|t| !t.paused) {
            task.stop_timer();
            task.paused = true;
            paused += 1;
        }
        drop(tasks);
        info!("⏸️  Paused {} poll tasks", paused);
        paused
    }

    pub async fn resume_all(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let visibility = self.visibility.current();
        let mut resumed = 0;
        for (id, task) in tasks.iter_mut().filter(|(_, t)| t.paused) {
            task.paused = false;
            task.interval = task.options.interval_for(visibility);
            task.start_timer(id, &self.shutdown);
            resumed += 1;
        }
        drop(tasks);
        info!("▶️  Resumed {} poll tasks", resumed);
        resumed
    }

    /// Runs one tick of `id` right away, outside its schedule.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTask` for unregistered ids, otherwise whatever
    /// the callback returned.
    pub async fn trigger_now(&self, id: &str) -> Result<()> {
        let (callback, counters) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::UnknownTask(id.to_string()))?;
            (Arc::clone(&task.callback), Arc::clone(&task.counters))
        };
        run_tick(id, callback.as_ref(), &counters).await
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn get_task_status(&self, id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(id)?;
        let last_error = task.counters.last_error.read().await.clone();
        Some(TaskStatus {
            id: id.to_string(),
            interval: task.interval,
            paused: task.paused,
            pause_on_hidden: task.options.pause_on_hidden,
            ticks: task.counters.ticks.load(Ordering::Relaxed),
            failures: task.counters.failures.load(Ordering::Relaxed),
            last_error,
            registered_for: task.registered_at.elapsed(),
        })
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    pub async fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility.current()
    }

    /// Stops the visibility listener and every timer. Terminal: later
    /// `register` calls fail with `Error::SchedulerStopped`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.write().await;
        let stopped = tasks.len();
        tasks.clear();
        drop(tasks);
        info!("🛑 Polling scheduler shut down ({} tasks stopped)", stopped);
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_timer(
    id: String,
    callback: Arc<dyn PollCallback>,
    counters: Arc<TaskCounters>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("⏱️  Poll timer armed: {} every {:?}", id, period);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // errors are recorded in the counters; the task keeps its schedule
        let _ = run_tick(&id, callback.as_ref(), &counters).await;
    }

    debug!("⏱️  Poll timer stopped: {}", id);
}

async fn run_tick(id: &str, callback: &dyn PollCallback, counters: &TaskCounters) -> Result<()> {
    counters.ticks.fetch_add(1, Ordering::Relaxed);

    let result = match AssertUnwindSafe(callback.tick()).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("💥 Poll task {} panicked", id);
            Err(Error::Custom(format!("poll task {id} panicked")))
        }
    };

    match &result {
        Ok(()) => debug!("✅ Poll tick: {}", id),
        Err(e) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️  Poll task {} failed: {}", id, e);
            *counters.last_error.write().await = Some(e.to_string());
        }
    }

    result
}
