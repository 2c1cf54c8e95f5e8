/**
 * Configuration constants and host configuration for the orchestration layer
 */
use super::data_type::{DataType, PolicyTier};
use super::loading::LoadingOptions;
use crate::error::{Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Default TTL applied to `RequestCache::request` when the caller gives none
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

/// How long a finalized loading state stays readable before it is purged
pub const LOADING_CLEANUP_DELAY_MS: u64 = 5_000;

/// Upper bound on a loading entry that is never stopped
pub const DEFAULT_MAX_LOADING_MS: u64 = 30_000;

/// Quiet period before a debounced subscription change is applied
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Buffered notifications per data type channel
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Balances tier: wallet-scoped data that users watch closely
pub const BALANCES_ACTIVE_INTERVAL_MS: u64 = 30_000;
pub const BALANCES_BACKGROUND_INTERVAL_MS: u64 = 120_000;
pub const BALANCES_CACHE_TTL_MS: u64 = 15_000;

/// Market-data tier, also the fallback for unknown data types
pub const MARKET_ACTIVE_INTERVAL_MS: u64 = 60_000;
pub const MARKET_BACKGROUND_INTERVAL_MS: u64 = 300_000;
pub const MARKET_CACHE_TTL_MS: u64 = 30_000;

/// Polling cadence and cache lifetime for one data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPolicy {
    pub active_interval_ms: u64,
    pub background_interval_ms: u64,
    pub cache_ttl_ms: u64,
}

impl DataPolicy {
    pub const BALANCES: Self = Self {
        active_interval_ms: BALANCES_ACTIVE_INTERVAL_MS,
        background_interval_ms: BALANCES_BACKGROUND_INTERVAL_MS,
        cache_ttl_ms: BALANCES_CACHE_TTL_MS,
    };

    pub const MARKET_DATA: Self = Self {
        active_interval_ms: MARKET_ACTIVE_INTERVAL_MS,
        background_interval_ms: MARKET_BACKGROUND_INTERVAL_MS,
        cache_ttl_ms: MARKET_CACHE_TTL_MS,
    };

    #[must_use]
    pub const fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    #[must_use]
    pub const fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Host configuration for an `Orchestrator`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub balances_tier: DataPolicy,
    pub market_data_tier: DataPolicy,
    /// Per data type policies keyed by the data type's name
    pub overrides: HashMap<String, DataPolicy>,
    pub default_cache_ttl_ms: u64,
    /// Options for the loading entries the registry starts on first subscribe
    pub loading: LoadingOptions,
    pub loading_cleanup_delay_ms: u64,
    pub pause_on_hidden: bool,
    pub notification_capacity: usize,
    pub debounce_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            balances_tier: DataPolicy::BALANCES,
            market_data_tier: DataPolicy::MARKET_DATA,
            overrides: HashMap::new(),
            default_cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            loading: LoadingOptions::default(),
            loading_cleanup_delay_ms: LOADING_CLEANUP_DELAY_MS,
            pause_on_hidden: true,
            notification_capacity: NOTIFICATION_CHANNEL_CAPACITY,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl OrchestratorConfig {
    /// Parses a JSON host configuration; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON for this shape, or
    /// if it fails `validate`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every policy a poll task could be built from.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInterval` for a zero active interval, or a zero
    /// background interval while `pause_on_hidden` is set, and
    /// `Error::Custom` for a zero notification capacity.
    pub fn validate(&self) -> Result<()> {
        let tiers = [("balances tier", &self.balances_tier), ("market-data tier", &self.market_data_tier)];
        let overrides = self
            .overrides
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(name, policy)| (name.as_str(), policy));

        for (name, policy) in tiers.into_iter().chain(overrides) {
            if policy.active_interval_ms == 0 {
                return Err(Error::InvalidInterval(format!("{name}: active interval is zero")));
            }
            if self.pause_on_hidden && policy.background_interval_ms == 0 {
                return Err(Error::InvalidInterval(format!("{name}: background interval is zero")));
            }
        }

        if self.notification_capacity == 0 {
            return Err(Error::Custom("notification_capacity must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Resolves the policy for `data_type`: explicit override first, then its
    /// tier. Data types without a tier get the market-data tier.
    #[must_use]
    pub fn policy_for(&self, data_type: &DataType) -> DataPolicy {
        if let Some(policy) = self.overrides.get(data_type.as_str()) {
            return *policy;
        }

        match data_type.tier() {
            Some(PolicyTier::Balances) => self.balances_tier,
            Some(PolicyTier::MarketData) => self.market_data_tier,
            None => {
                warn!(
                    "⚠️  No polling policy for data type {}, using market-data tier",
                    data_type
                );
                self.market_data_tier
            }
        }
    }

    #[must_use]
    pub const fn default_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.default_cache_ttl_ms)
    }

    #[must_use]
    pub const fn loading_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.loading_cleanup_delay_ms)
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_CACHE_TTL_MS > 0, "DEFAULT_CACHE_TTL_MS must be greater than 0");
    assert!(NOTIFICATION_CHANNEL_CAPACITY > 0, "NOTIFICATION_CHANNEL_CAPACITY must be greater than 0");
    assert!(
        BALANCES_ACTIVE_INTERVAL_MS <= BALANCES_BACKGROUND_INTERVAL_MS,
        "background polling must not be faster than foreground polling"
    );
    assert!(
        MARKET_ACTIVE_INTERVAL_MS <= MARKET_BACKGROUND_INTERVAL_MS,
        "background polling must not be faster than foreground polling"
    );
    assert!(BALANCES_ACTIVE_INTERVAL_MS > 0 && MARKET_ACTIVE_INTERVAL_MS > 0, "intervals must be greater than 0");
};
