use datapulse::Orchestrator;
use datapulse::orchestration::subscription::{loading_id, poll_task_id};
use datapulse::orchestration::{
    DataEvent, DataType, LOADING_TIMEOUT_MESSAGE, LoadingOptions, LoadingPhase, ManualVisibility,
    OrchestratorConfig, RequestOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

fn orchestrator() -> (Arc<Orchestrator>, Arc<ManualVisibility>) {
    let visibility = Arc::new(ManualVisibility::default());
    let orchestrator = Orchestrator::start(OrchestratorConfig::default(), visibility.clone()).unwrap();
    (orchestrator, visibility)
}

#[tokio::test(start_paused = true)]
async fn test_ref_counted_poll_task_lifecycle() {
    let (orch, _visibility) = orchestrator();
    let registry = orch.registry();
    let task = poll_task_id(&DataType::Balances);

    let sub_a = registry.subscribe("compA", DataType::Balances, None).await;
    let sub_b = registry.subscribe("compB", DataType::Balances, None).await;
    assert_eq!(registry.ref_count(&DataType::Balances).await, 2);
    assert_eq!(orch.scheduler().task_count().await, 1);

    assert!(registry.unsubscribe(&sub_a).await);
    assert_eq!(registry.ref_count(&DataType::Balances).await, 1);
    assert!(orch.scheduler().is_registered(&task).await);

    assert!(registry.unsubscribe(&sub_b).await);
    assert_eq!(registry.ref_count(&DataType::Balances).await, 0);
    assert!(!orch.scheduler().is_registered(&task).await);

    // second unsubscribe has no further effect
    assert!(!registry.unsubscribe(&sub_b).await);
    assert_eq!(registry.ref_count(&DataType::Balances).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let (orch, _visibility) = orchestrator();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch_chains = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(vec!["ethereum".to_string(), "polygon".to_string()])
        }
    };
    let options = RequestOptions::with_ttl(Duration::from_secs(300));

    let cache = orch.cache();
    let first = cache.request("chains", fetch_chains(Arc::clone(&calls)), options);
    let second = async {
        sleep(Duration::from_millis(50)).await;
        cache.request("chains", fetch_chains(Arc::clone(&calls)), options).await
    };
    let (first, second) = tokio::join!(first, second);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 2);

    let stats = cache.get_cache_stats().await;
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.coalesced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cached_value_until_ttl_elapses() {
    let (orch, _visibility) = orchestrator();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = RequestOptions::with_ttl(Duration::from_secs(5));

    let fetch = |calls: Arc<AtomicUsize>| {
        move || async move { Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst)) }
    };

    let v1 = orch.cache().request("nonce", fetch(Arc::clone(&calls)), options).await.unwrap();
    sleep(Duration::from_secs(4)).await;
    let v2 = orch.cache().request("nonce", fetch(Arc::clone(&calls)), options).await.unwrap();
    assert_eq!((*v1, *v2), (0, 0));

    sleep(Duration::from_secs(2)).await;
    let v3 = orch.cache().request("nonce", fetch(Arc::clone(&calls)), options).await.unwrap();
    assert_eq!(*v3, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_min_loading_time_holds_indicator() {
    let (orch, _visibility) = orchestrator();
    let loading = orch.loading();
    let options = LoadingOptions::default().min_loading_time(Duration::from_millis(300));

    loading.start_loading("balances-fetch", Some("Loading..."), options).await;
    sleep(Duration::from_millis(50)).await;
    loading.stop_loading("balances-fetch", None).await;

    sleep(Duration::from_millis(200)).await;
    assert!(loading.is_loading("balances-fetch").await);

    sleep(Duration::from_millis(60)).await;
    assert!(!loading.is_loading("balances-fetch").await);
    let state = loading.get_state("balances-fetch").await.unwrap();
    assert_eq!(state.phase(), LoadingPhase::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_max_loading_time_times_out() {
    let (orch, _visibility) = orchestrator();
    let loading = orch.loading();
    let options = LoadingOptions::default().max_loading_time(Duration::from_millis(1000));

    loading.start_loading("x", None, options).await;
    sleep(Duration::from_millis(990)).await;
    assert!(loading.is_loading("x").await);

    sleep(Duration::from_millis(20)).await;
    let state = loading.get_state("x").await.unwrap();
    assert!(!state.is_loading);
    assert_eq!(state.error.as_deref(), Some(LOADING_TIMEOUT_MESSAGE));
    assert!(state.timed_out());
}

#[tokio::test(start_paused = true)]
async fn test_has_subscriptions_tracks_single_subscription() {
    let (orch, _visibility) = orchestrator();
    let registry = orch.registry();

    assert!(!registry.has_subscriptions(&DataType::MarketData, None).await);
    let id = registry.subscribe("chart", DataType::MarketData, None).await;
    assert!(registry.has_subscriptions(&DataType::MarketData, None).await);
    registry.unsubscribe(&id).await;
    assert!(!registry.has_subscriptions(&DataType::MarketData, None).await);
}

#[tokio::test(start_paused = true)]
async fn test_background_switches_poll_interval() {
    let (orch, visibility) = orchestrator();
    orch.registry().subscribe("portfolio", DataType::Balances, None).await;
    let task = poll_task_id(&DataType::Balances);

    let status = orch.scheduler().get_task_status(&task).await.unwrap();
    assert_eq!(status.interval, Duration::from_secs(30));

    visibility.background();
    sleep(Duration::from_millis(1)).await;
    let status = orch.scheduler().get_task_status(&task).await.unwrap();
    assert_eq!(status.interval, Duration::from_secs(120));

    visibility.foreground();
    sleep(Duration::from_millis(1)).await;
    let status = orch.scheduler().get_task_status(&task).await.unwrap();
    assert_eq!(status.interval, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_needed_then_refresh_drive_fetches() {
    let (orch, _visibility) = orchestrator();
    let mut rx = orch.registry().notifications(&DataType::TokenPrices).await;
    let calls = Arc::new(AtomicUsize::new(0));

    orch.registry().subscribe("ticker", DataType::TokenPrices, None).await;
    assert_eq!(rx.recv().await.unwrap().event, DataEvent::Needed);
    assert!(orch.loading().is_loading(&loading_id(&DataType::TokenPrices)).await);

    let counter = Arc::clone(&calls);
    orch.fetch(&DataType::TokenPrices, "prices", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(1_850_u64)
    })
    .await
    .unwrap();
    assert!(!orch.loading().is_loading(&loading_id(&DataType::TokenPrices)).await);

    // market tier polls every 60s while in the foreground
    assert_eq!(rx.recv().await.unwrap().event, DataEvent::Refresh);
    let counter = Arc::clone(&calls);
    orch.fetch(&DataType::TokenPrices, "prices", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(1_851_u64)
    })
    .await
    .unwrap();
    // 30s ttl elapsed by the time of the refresh
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_config_overrides_apply_to_registry_tasks() {
    let config = OrchestratorConfig::from_json(
        r#"{
            "overrides": {
                "tokenPrices": {"active_interval_ms": 5000, "background_interval_ms": 20000, "cache_ttl_ms": 2000}
            },
            "pause_on_hidden": false
        }"#,
    )
    .unwrap();
    let visibility = Arc::new(ManualVisibility::default());
    let orch = Orchestrator::start(config, visibility.clone()).unwrap();

    orch.registry().subscribe("ticker", DataType::TokenPrices, None).await;
    let task = poll_task_id(&DataType::TokenPrices);
    let status = orch.scheduler().get_task_status(&task).await.unwrap();
    assert_eq!(status.interval, Duration::from_secs(5));
    assert!(!status.pause_on_hidden);

    visibility.background();
    sleep(Duration::from_millis(1)).await;
    let status = orch.scheduler().get_task_status(&task).await.unwrap();
    assert_eq!(status.interval, Duration::from_secs(5));
}
