use super::config::OrchestratorConfig;
use super::data_type::DataType;
use super::loading::LoadingStateTracker;
use super::polling::{PollOptions, PollingScheduler};
use crate::error::Result;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Poll task and loading ids owned by the registry live under this prefix;
/// collaborators registering their own tasks must use another namespace.
pub const REGISTRY_TASK_PREFIX: &str = "subscription:";

#[must_use]
pub fn poll_task_id(data_type: &DataType) -> String {
    format!("{REGISTRY_TASK_PREFIX}{data_type}")
}

#[must_use]
pub fn loading_id(data_type: &DataType) -> String {
    format!("{REGISTRY_TASK_PREFIX}{data_type}")
}

/// Wallet/chain scoping of a subscription. An empty dimension means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParams {
    #[serde(default)]
    pub wallets: BTreeSet<String>,
    #[serde(default)]
    pub chains: BTreeSet<String>,
}

impl FilterParams {
    #[must_use]
    pub fn for_wallet(address: &str) -> Self {
        Self::default().with_wallet(address)
    }

    #[must_use]
    pub fn with_wallet(mut self, address: &str) -> Self {
        self.wallets.insert(address.to_lowercase());
        self
    }

    #[must_use]
    pub fn with_chain(mut self, chain: &str) -> Self {
        self.chains.insert(chain.to_string());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty() && self.chains.is_empty()
    }

    /// True when every dimension constrained by `filter` overlaps this
    /// subscription's scope. Unscoped dimensions match anything.
    #[must_use]
    pub fn intersects(&self, filter: &Self) -> bool {
        fn overlaps(mine: &BTreeSet<String>, wanted: &BTreeSet<String>) -> bool {
            wanted.is_empty() || mine.is_empty() || !mine.is_disjoint(wanted)
        }
        overlaps(&self.wallets, &filter.wallets) && overlaps(&self.chains, &filter.chains)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: String,
    pub subscriber_id: String,
    pub data_type: DataType,
    pub params: Option<FilterParams>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    fn matches(&self, filter: Option<&FilterParams>) -> bool {
        match (filter, &self.params) {
            (Some(filter), Some(params)) => params.intersects(filter),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEvent {
    /// First subscriber arrived; fetch-controllers should start fetching
    Needed,
    /// Last subscriber left
    NotNeeded,
    /// Poll tick while the data type is needed
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNotification {
    pub data_type: DataType,
    pub event: DataEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_subscriptions: usize,
    pub total_subscribers: usize,
    pub ref_counts: BTreeMap<String, usize>,
    pub active_poll_tasks: usize,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<String, Subscription>,
    by_subscriber: HashMap<String, BTreeSet<String>>,
    ref_counts: HashMap<DataType, usize>,
    channels: HashMap<DataType, broadcast::Sender<DataNotification>>,
}

impl RegistryState {
    fn sender(&mut self, data_type: &DataType, capacity: usize) -> broadcast::Sender<DataNotification> {
        self.channels
            .entry(data_type.clone())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }

    /// Removes an active subscription. The flag is set when the removal took
    /// its data type's ref count to zero.
    fn remove(&mut self, subscription_id: &str) -> Option<(Subscription, bool)> {
        let mut subscription = self.subscriptions.remove(subscription_id)?;
        subscription.active = false;

        if let Some(ids) = self.by_subscriber.get_mut(&subscription.subscriber_id) {
            ids.remove(subscription_id);
            if ids.is_empty() {
                self.by_subscriber.remove(&subscription.subscriber_id);
            }
        }

        let remaining = match self.ref_counts.get_mut(&subscription.data_type) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.ref_counts.remove(&subscription.data_type);
        }

        Some((subscription, remaining == 0))
    }
}

/// Ref-counted demand tracking per data type.
///
/// The first subscriber for a data type starts its loading entry, registers
/// its poll task and publishes `DataEvent::Needed`; the last one leaving
/// tears all of that down and publishes `DataEvent::NotNeeded`. Both happen
/// before `subscribe`/`unsubscribe` return.
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    scheduler: Arc<PollingScheduler>,
    loading: Arc<LoadingStateTracker>,
    config: Arc<OrchestratorConfig>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry").finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// # Errors
    ///
    /// Returns `Error::InvalidInterval` when any policy in `config` has a
    /// zero-length poll interval.
    pub fn new(
        scheduler: Arc<PollingScheduler>,
        loading: Arc<LoadingStateTracker>,
        config: Arc<OrchestratorConfig>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(RegistryState::default()),
            scheduler,
            loading,
            config,
        })
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        data_type: DataType,
        params: Option<FilterParams>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        state.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                subscriber_id: subscriber_id.to_string(),
                data_type: data_type.clone(),
                params,
                active: true,
                created_at: Utc::now(),
            },
        );
        state
            .by_subscriber
            .entry(subscriber_id.to_string())
            .or_default()
            .insert(id.clone());

        let count = state.ref_counts.entry(data_type.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        debug!("➕ {} subscribed to {} (ref count {})", subscriber_id, data_type, count);

        if count == 1 {
            let sender = state.sender(&data_type, self.config.notification_capacity);
            self.activate(&data_type, sender).await;
        }

        id
    }

    async fn activate(&self, data_type: &DataType, sender: broadcast::Sender<DataNotification>) {
        let policy = self.config.policy_for(data_type);

        self.loading
            .start_loading(
                &loading_id(data_type),
                Some(&format!("Loading {data_type}...")),
                self.config.loading,
            )
            .await;

        // the registry owns `subscription:*` ids; anything registered there
        // by someone else is replaced
        let options = PollOptions::new(policy.active_interval(), policy.background_interval())
            .pause_on_hidden(self.config.pause_on_hidden);
        let refresh_sender = sender.clone();
        let refresh_type = data_type.clone();
        let registered = self
            .scheduler
            .register(
                &poll_task_id(data_type),
                move || {
                    let notification = DataNotification {
                        data_type: refresh_type.clone(),
                        event: DataEvent::Refresh,
                    };
                    if refresh_sender.send(notification).is_err() {
                        debug!("No listeners for {} refresh", refresh_type);
                    }
                    futures::future::ready(Result::Ok(()))
                },
                options,
            )
            .await;
        if let Err(e) = registered {
            warn!("⚠️  Could not register poll task for {}: {}", data_type, e);
        }

        Self::publish(&sender, data_type, DataEvent::Needed);
        info!("📡 {} needed (every {:?})", data_type, policy.active_interval());
    }

    async fn deactivate(&self, data_type: &DataType, sender: &broadcast::Sender<DataNotification>) {
        self.loading.stop_loading(&loading_id(data_type), None).await;
        self.scheduler.unregister(&poll_task_id(data_type)).await;
        Self::publish(sender, data_type, DataEvent::NotNeeded);
        info!("📴 {} no longer needed", data_type);
    }

    fn publish(sender: &broadcast::Sender<DataNotification>, data_type: &DataType, event: DataEvent) {
        let notification = DataNotification {
            data_type: data_type.clone(),
            event,
        };
        if sender.send(notification).is_err() {
            debug!("No listeners for {} {:?}", data_type, event);
        }
    }

    /// Returns false for unknown or already removed ids.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some((subscription, last)) = state.remove(subscription_id) else {
            debug!("Redundant unsubscribe for {}", subscription_id);
            return false;
        };
        debug!(
            "➖ {} unsubscribed from {}",
            subscription.subscriber_id, subscription.data_type
        );

        if last {
            let sender = state.sender(&subscription.data_type, self.config.notification_capacity);
            self.deactivate(&subscription.data_type, &sender).await;
        }
        drop(guard);
        true
    }

    /// Tears down every subscription owned by `subscriber_id`; returns how
    /// many were removed.
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let ids = state.by_subscriber.get(subscriber_id).cloned().unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            if let Some((subscription, last)) = state.remove(&id) {
                removed += 1;
                if last {
                    let sender = state.sender(&subscription.data_type, self.config.notification_capacity);
                    self.deactivate(&subscription.data_type, &sender).await;
                }
            }
        }
        drop(guard);

        if removed > 0 {
            info!("🧹 Removed {} subscriptions for {}", removed, subscriber_id);
        }
        removed
    }

    /// Drops every subscription, tearing down each active data type as if
    /// its last subscriber had left. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let removed = state.subscriptions.len();
        let active: Vec<DataType> = state.ref_counts.keys().cloned().sorted().collect();
        state.subscriptions.clear();
        state.by_subscriber.clear();
        state.ref_counts.clear();

        for data_type in &active {
            let sender = state.sender(data_type, self.config.notification_capacity);
            self.deactivate(data_type, &sender).await;
        }
        drop(guard);

        info!("🧹 Registry cleared ({} subscriptions, {} data types)", removed, active.len());
        removed
    }

    /// True when at least one active subscription for `data_type` matches
    /// `filter` (or any subscription at all without a filter).
    pub async fn has_subscriptions(&self, data_type: &DataType, filter: Option<&FilterParams>) -> bool {
        self.state
            .read()
            .await
            .subscriptions
            .values()
            .any(|s| s.active && &s.data_type == data_type && s.matches(filter))
    }

    pub async fn ref_count(&self, data_type: &DataType) -> usize {
        self.state
            .read()
            .await
            .ref_counts
            .get(data_type)
            .copied()
            .unwrap_or(0)
    }

    /// Channel carrying `Needed`/`NotNeeded`/`Refresh` events for one data type.
    pub async fn notifications(&self, data_type: &DataType) -> broadcast::Receiver<DataNotification> {
        self.state
            .write()
            .await
            .sender(data_type, self.config.notification_capacity)
            .subscribe()
    }

    pub async fn get_subscriptions(&self, data_type: &DataType) -> Vec<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.active && &s.data_type == data_type)
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .collect()
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn get_subscriber_subscriptions(&self, subscriber_id: &str) -> Vec<Subscription> {
        let state = self.state.read().await;
        state
            .by_subscriber
            .get(subscriber_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.subscriptions.get(id))
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .collect()
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let (total_subscriptions, total_subscribers, ref_counts) = {
            let state = self.state.read().await;
            let ref_counts = state
                .ref_counts
                .iter()
                .map(|(data_type, count)| (data_type.to_string(), *count))
                .collect();
            (state.subscriptions.len(), state.by_subscriber.len(), ref_counts)
        };

        let active_poll_tasks = self
            .scheduler
            .task_ids()
            .await
            .iter()
            .filter(|id| id.starts_with(REGISTRY_TASK_PREFIX))
            .count();

        RegistryStats {
            total_subscriptions,
            total_subscribers,
            ref_counts,
            active_poll_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::visibility::ManualVisibility;

    fn registry() -> (SubscriptionRegistry, Arc<PollingScheduler>, Arc<LoadingStateTracker>) {
        let scheduler = PollingScheduler::start(Arc::new(ManualVisibility::default()));
        let loading = Arc::new(LoadingStateTracker::default());
        let registry = SubscriptionRegistry::new(
            Arc::clone(&scheduler),
            Arc::clone(&loading),
            Arc::new(OrchestratorConfig::default()),
        )
        .unwrap();
        (registry, scheduler, loading)
    }

    #[test]
    fn test_filter_intersection() {
        let wallet_a = FilterParams::for_wallet("0xAAA").with_chain("1");
        let wallet_b = FilterParams::for_wallet("0xbbb");

        assert!(wallet_a.intersects(&FilterParams::for_wallet("0xaaa")));
        assert!(!wallet_a.intersects(&wallet_b));
        assert!(wallet_a.intersects(&FilterParams::default().with_chain("1")));
        assert!(!wallet_a.intersects(&FilterParams::default().with_chain("137")));
        assert!(FilterParams::default().intersects(&wallet_b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_subscribes_register_one_task() {
        let (registry, scheduler, _) = registry();

        let a = registry.subscribe("a", DataType::Balances, None).await;
        let b = registry.subscribe("b", DataType::Balances, None).await;
        let c = registry.subscribe("c", DataType::Balances, None).await;

        assert_eq!(registry.ref_count(&DataType::Balances).await, 3);
        assert_eq!(scheduler.task_ids().await, vec![poll_task_id(&DataType::Balances)]);

        for id in [&a, &b] {
            assert!(registry.unsubscribe(id).await);
        }
        assert!(scheduler.is_registered(&poll_task_id(&DataType::Balances)).await);

        assert!(registry.unsubscribe(&c).await);
        assert_eq!(registry.ref_count(&DataType::Balances).await, 0);
        assert_eq!(scheduler.task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let (registry, scheduler, _) = registry();
        let mut rx = registry.notifications(&DataType::MarketData).await;

        let id = registry.subscribe("a", DataType::MarketData, None).await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);

        assert!(registry.unsubscribe(&id).await);
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::NotNeeded);

        assert!(!registry.unsubscribe(&id).await);
        assert!(!registry.unsubscribe("never-existed").await);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.ref_count(&DataType::MarketData).await, 0);
        assert_eq!(scheduler.task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscriber_starts_loading() {
        let (registry, _, loading) = registry();
        let id = registry.subscribe("a", DataType::TokenPrices, None).await;
        assert!(loading.is_loading(&loading_id(&DataType::TokenPrices)).await);

        registry.unsubscribe(&id).await;
        assert!(!loading.is_loading(&loading_id(&DataType::TokenPrices)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_all_and_lookups() {
        let (registry, scheduler, _) = registry();
        let wallet = FilterParams::for_wallet("0xabc");

        registry.subscribe("panel", DataType::Balances, Some(wallet.clone())).await;
        registry.subscribe("panel", DataType::Transactions, Some(wallet.clone())).await;
        registry.subscribe("header", DataType::Balances, None).await;

        assert_eq!(registry.get_subscriber_subscriptions("panel").await.len(), 2);
        assert_eq!(registry.get_subscriptions(&DataType::Balances).await.len(), 2);

        let stats = registry.get_stats().await;
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.total_subscribers, 2);
        assert_eq!(stats.ref_counts.get("balances"), Some(&2));
        assert_eq!(stats.active_poll_tasks, 2);

        assert_eq!(registry.unsubscribe_all("panel").await, 2);
        assert_eq!(registry.unsubscribe_all("panel").await, 0);
        assert_eq!(registry.ref_count(&DataType::Balances).await, 1);
        assert!(!registry.has_subscriptions(&DataType::Transactions, None).await);
        assert_eq!(scheduler.task_ids().await, vec![poll_task_id(&DataType::Balances)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_subscriptions_with_filter() {
        let (registry, _, _) = registry();
        registry
            .subscribe("a", DataType::Balances, Some(FilterParams::for_wallet("0xaaa")))
            .await;

        assert!(registry.has_subscriptions(&DataType::Balances, None).await);
        assert!(
            registry
                .has_subscriptions(&DataType::Balances, Some(&FilterParams::for_wallet("0xAAA")))
                .await
        );
        assert!(
            !registry
                .has_subscriptions(&DataType::Balances, Some(&FilterParams::for_wallet("0xbbb")))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_ticks_publish_refresh() {
        let (registry, _, _) = registry();
        let data_type = DataType::Other("nftFloors".to_string());
        let mut rx = registry.notifications(&data_type).await;

        registry.subscribe("a", data_type.clone(), None).await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);

        // unknown types poll on the market-data tier
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event, DataEvent::Refresh);
        assert_eq!(notification.data_type, data_type);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscriber_takes_over_task_id_in_use() {
        let (registry, scheduler, _) = registry();
        let task = poll_task_id(&DataType::Balances);
        let stray_ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&stray_ticks);
        scheduler
            .register(
                &task,
                move || {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    futures::future::ready(Result::Ok(()))
                },
                PollOptions::new(std::time::Duration::from_secs(10), std::time::Duration::from_secs(10)),
            )
            .await
            .unwrap();

        let mut rx = registry.notifications(&DataType::Balances).await;
        let id = registry.subscribe("a", DataType::Balances, None).await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);

        // balances tier polls every 30s in the foreground
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert_eq!(rx.try_recv().unwrap().event, DataEvent::Refresh);
        assert_eq!(stray_ticks.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(scheduler.task_count().await, 1);

        assert!(registry.unsubscribe(&id).await);
        assert!(!scheduler.is_registered(&task).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_config_is_rejected() {
        let scheduler = PollingScheduler::start(Arc::new(ManualVisibility::default()));
        let mut config = OrchestratorConfig::default();
        config.balances_tier.active_interval_ms = 0;

        let result = SubscriptionRegistry::new(scheduler, Arc::new(LoadingStateTracker::default()), Arc::new(config));
        assert!(matches!(result, Err(crate::error::Error::InvalidInterval(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_tears_down_every_data_type() {
        let (registry, scheduler, loading) = registry();
        let mut rx = registry.notifications(&DataType::MarketData).await;

        registry.subscribe("a", DataType::MarketData, None).await;
        registry.subscribe("b", DataType::MarketData, None).await;
        registry.subscribe("b", DataType::Balances, None).await;
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);

        assert_eq!(registry.clear().await, 3);
        assert_eq!(rx.recv().await.unwrap().event, DataEvent::NotNeeded);
        assert_eq!(registry.ref_count(&DataType::MarketData).await, 0);
        assert_eq!(registry.ref_count(&DataType::Balances).await, 0);
        assert_eq!(scheduler.task_count().await, 0);
        assert!(loading.get_active_states().await.is_empty());
        assert_eq!(registry.get_stats().await.total_subscribers, 0);
    }
}
