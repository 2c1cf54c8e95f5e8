pub mod config;
pub mod data_type;
pub mod debounce;
pub mod loading;
pub mod polling;
pub mod request_cache;
pub mod subscription;
pub mod visibility;

pub use config::{DataPolicy, OrchestratorConfig};
pub use data_type::{DataType, PolicyTier};
pub use debounce::{DebouncedSubscriptions, WatchPhase};
pub use loading::{LoadingOptions, LoadingPhase, LoadingState, LoadingStateTracker, LOADING_TIMEOUT_MESSAGE};
pub use polling::{PollCallback, PollOptions, PollingScheduler, TaskStatus};
pub use request_cache::{CacheStats, RequestCache, RequestOptions, RequestPriority};
pub use subscription::{
    DataEvent, DataNotification, FilterParams, RegistryStats, Subscription, SubscriptionRegistry,
};
pub use visibility::{ManualVisibility, Visibility, VisibilitySource};
