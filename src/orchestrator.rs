/**
Orchestration context for `datapulse`

One `Orchestrator` is built per application and handed to UI components and
fetch-controllers by reference. It owns the request cache, the polling
scheduler, the loading tracker and the subscription registry, so separate
instances (one per test, say) never share state.
*/
use crate::error::{Error, Result};
use crate::orchestration::subscription::loading_id;
use crate::orchestration::{
    DataType, DebouncedSubscriptions, LoadingStateTracker, OrchestratorConfig, PollingScheduler,
    RequestCache, RequestOptions, SubscriptionRegistry, VisibilitySource,
};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    cache: Arc<RequestCache>,
    scheduler: Arc<PollingScheduler>,
    loading: Arc<LoadingStateTracker>,
    registry: Arc<SubscriptionRegistry>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Snapshot of every component's counters, as printed by the demo binary.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub cache: crate::orchestration::CacheStats,
    pub registry: crate::orchestration::RegistryStats,
    pub poll_tasks: Vec<String>,
    pub active_loading: Vec<String>,
}

impl Orchestrator {
    /// Builds every component from `config`. Must be called from within a
    /// tokio runtime since the scheduler spawns its visibility listener.
    ///
    /// # Errors
    ///
    /// Returns the error from `OrchestratorConfig::validate` for a config
    /// that could not drive its poll tasks.
    pub fn start(config: OrchestratorConfig, visibility: Arc<dyn VisibilitySource>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let cache = Arc::new(RequestCache::new(config.default_cache_ttl()));
        let scheduler = PollingScheduler::start(visibility);
        let loading = Arc::new(LoadingStateTracker::new(config.loading_cleanup_delay()));
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&scheduler),
            Arc::clone(&loading),
            Arc::clone(&config),
        )?);

        info!(
            "🚀 Orchestrator started (cache ttl {:?}, debounce {:?})",
            config.default_cache_ttl(),
            config.debounce()
        );

        Ok(Arc::new(Self {
            config,
            cache,
            scheduler,
            loading,
            registry,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn loading(&self) -> &Arc<LoadingStateTracker> {
        &self.loading
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Debounced subscription handle for a reactive watcher, using the
    /// configured debounce delay.
    #[must_use]
    pub fn debounced(&self, subscriber_id: &str) -> DebouncedSubscriptions {
        DebouncedSubscriptions::new(Arc::clone(&self.registry), subscriber_id, self.config.debounce())
    }

    /// Fetches `key` on behalf of `data_type` through the request cache,
    /// using the data type's cache TTL and priority, then finishes the data
    /// type's loading entry with the outcome.
    ///
    /// # Errors
    ///
    /// Propagates the request cache's error, after recording it on the
    /// loading entry.
    pub async fn fetch<T, F, Fut, E>(&self, data_type: &DataType, key: &str, fetch: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = core::result::Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let policy = self.config.policy_for(data_type);
        let options = RequestOptions::with_ttl(policy.cache_ttl()).priority(data_type.priority());

        let result = self.cache.request(key, fetch, options).await;

        let error = match &result {
            Ok(_) => None,
            Err(Error::Fetch(failure)) => Some(failure.message.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = &error {
            warn!("❌ Fetch of {} for {} failed: {}", key, data_type, message);
        }
        self.loading.stop_loading(&loading_id(data_type), error).await;

        result
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cache: self.cache.get_cache_stats().await,
            registry: self.registry.get_stats().await,
            poll_tasks: self.scheduler.task_ids().await,
            active_loading: self
                .loading
                .get_active_states()
                .await
                .into_iter()
                .map(|s| s.id)
                .collect(),
        }
    }

    /// Drops every subscription (publishing `NotNeeded` for each active data
    /// type), stops every timer and drops cached data and loading entries.
    ///
    /// Shutdown is terminal: the scheduler refuses new poll tasks afterwards,
    /// so build a new `Orchestrator` instead of reusing this one.
    pub async fn shutdown(&self) {
        self.registry.clear().await;
        self.scheduler.shutdown().await;
        self.loading.clear_all().await;
        self.cache.clear_all_cache().await;
        info!("🛑 Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{DataEvent, DataPolicy, ManualVisibility, PollOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn orchestrator() -> Arc<Orchestrator> {
        Orchestrator::start(OrchestratorConfig::default(), Arc::new(ManualVisibility::default())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_finishes_loading_entry() {
        let orch = orchestrator();
        orch.registry().subscribe("portfolio", DataType::Balances, None).await;
        let id = loading_id(&DataType::Balances);
        assert!(orch.loading().is_loading(&id).await);

        let value = orch
            .fetch(&DataType::Balances, "balances:0xabc", || async {
                Ok::<_, String>(vec![1u64, 2, 3])
            })
            .await
            .unwrap();
        assert_eq!(*value, vec![1, 2, 3]);
        assert!(!orch.loading().is_loading(&id).await);
        assert_eq!(orch.loading().get_state(&id).await.unwrap().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_lands_on_loading_entry() {
        let orch = orchestrator();
        orch.registry().subscribe("prices", DataType::TokenPrices, None).await;

        let result = orch
            .fetch::<u64, _, _, _>(&DataType::TokenPrices, "prices", || async {
                Err::<u64, _>("upstream 502")
            })
            .await;
        assert!(matches!(result, Err(Error::Fetch(_))));

        let state = orch
            .loading()
            .get_state(&loading_id(&DataType::TokenPrices))
            .await
            .unwrap();
        assert_eq!(state.error.as_deref(), Some("upstream 502"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_uses_data_type_ttl() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            orch.fetch(&DataType::Balances, "balances", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1u8)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // balances tier ttl is 15s
        sleep(Duration::from_secs(16)).await;
        let calls_after = Arc::clone(&calls);
        orch.fetch(&DataType::Balances, "balances", move || async move {
            calls_after.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(1u8)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_are_isolated() {
        let a = orchestrator();
        let b = orchestrator();
        let mut rx = b.registry().notifications(&DataType::MarketData).await;

        a.registry().subscribe("chart", DataType::MarketData, None).await;
        assert_eq!(a.registry().ref_count(&DataType::MarketData).await, 1);
        assert_eq!(b.registry().ref_count(&DataType::MarketData).await, 0);
        assert!(rx.try_recv().is_err());

        b.registry().subscribe("chart", DataType::MarketData, None).await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let orch = orchestrator();
        let mut rx = orch.registry().notifications(&DataType::PortfolioValue).await;
        orch.registry().subscribe("portfolio", DataType::PortfolioValue, None).await;
        assert_eq!(orch.scheduler().task_count().await, 1);
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);

        orch.shutdown().await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::NotNeeded);
        let stats = orch.stats().await;
        assert!(stats.poll_tasks.is_empty());
        assert!(stats.active_loading.is_empty());
        assert_eq!(stats.cache.total_entries, 0);
        assert_eq!(stats.registry.total_subscriptions, 0);
        assert!(stats.registry.ref_counts.is_empty());

        let options = PollOptions::new(Duration::from_secs(1), Duration::from_secs(10));
        let late = orch.scheduler().register("late", || async { Ok(()) }, options).await;
        assert!(matches!(late, Err(Error::SchedulerStopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected_at_start() {
        let mut config = OrchestratorConfig::default();
        config.overrides.insert(
            "balances".to_string(),
            DataPolicy {
                active_interval_ms: 0,
                background_interval_ms: 120_000,
                cache_ttl_ms: 15_000,
            },
        );
        let result = Orchestrator::start(config, Arc::new(ManualVisibility::default()));
        assert!(matches!(result, Err(Error::InvalidInterval(_))));
    }
}
