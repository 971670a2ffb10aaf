//! Engine configuration.
//!
//! Defaults mirror the production dashboard: 5s/30s/60s polling, a 60s idle
//! timeout, a 10s cache TTL and five reconnect attempts for the live channel.
//!
//! Durations are stored as `*_ms` integers so YAML files stay readable; use
//! the accessor methods to get a `Duration`.
//!
//! ```yaml
//! polling:
//!   active_interval_ms: 5000
//!   idle_timeout_ms: 60000
//! fetch:
//!   max_depth: 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for a `NetworkSyncEngine`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub polling: PollingConfig,
    pub stream: StreamConfig,
}

impl SyncConfig {
    /// Parse a YAML document; missing fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Defaults overridden by `GENEALOGY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `GENEALOGY_*` overrides read through `lookup`.
    ///
    /// Recognised variables: `GENEALOGY_MAX_DEPTH`, `GENEALOGY_MAX_FANOUT`,
    /// `GENEALOGY_FETCH_CONCURRENCY`, `GENEALOGY_READ_TIMEOUT_MS`,
    /// `GENEALOGY_CACHE_TTL_MS`, `GENEALOGY_CACHE_MAX_ENTRIES`,
    /// `GENEALOGY_ACTIVE_INTERVAL_MS`, `GENEALOGY_INACTIVE_INTERVAL_MS`,
    /// `GENEALOGY_BACKGROUND_INTERVAL_MS`, `GENEALOGY_IDLE_TIMEOUT_MS`,
    /// `GENEALOGY_STREAM_ENABLED`, `GENEALOGY_STREAM_MAX_RETRIES`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        macro_rules! apply {
            ($var:literal => $field:expr) => {
                if let Some(value) = lookup($var) {
                    $field = parse($var, value)?;
                }
            };
        }

        apply!("GENEALOGY_MAX_DEPTH" => self.fetch.max_depth);
        apply!("GENEALOGY_MAX_FANOUT" => self.fetch.max_fanout);
        apply!("GENEALOGY_FETCH_CONCURRENCY" => self.fetch.concurrency);
        apply!("GENEALOGY_READ_TIMEOUT_MS" => self.fetch.read_timeout_ms);
        apply!("GENEALOGY_CACHE_TTL_MS" => self.cache.ttl_ms);
        apply!("GENEALOGY_CACHE_MAX_ENTRIES" => self.cache.max_entries);
        apply!("GENEALOGY_ACTIVE_INTERVAL_MS" => self.polling.active_interval_ms);
        apply!("GENEALOGY_INACTIVE_INTERVAL_MS" => self.polling.inactive_interval_ms);
        apply!("GENEALOGY_BACKGROUND_INTERVAL_MS" => self.polling.background_interval_ms);
        apply!("GENEALOGY_IDLE_TIMEOUT_MS" => self.polling.idle_timeout_ms);
        apply!("GENEALOGY_STREAM_ENABLED" => self.stream.enabled);
        apply!("GENEALOGY_STREAM_MAX_RETRIES" => self.stream.max_retries);

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fetch.validate()?;
        self.cache.validate()?;
        self.polling.validate()
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ============================================================================
// FETCH
// ============================================================================

/// Bounded tree fetch limits and ledger read policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Default depth limit when a subscriber does not set one
    pub max_depth: u32,
    /// Default fan-out limit when a subscriber does not set one
    pub max_fanout: usize,
    /// Maximum concurrent ledger reads within one fetch
    pub concurrency: usize,
    /// Timeout of a single ledger read
    pub read_timeout_ms: u64,
    /// Attempts per read for transient failures (1 = no retry)
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub retry_base_ms: u64,
    /// Child slots a parent may spend on rejected children (unreadable,
    /// cyclic or duplicate) on top of `max_fanout`
    pub max_rejected_slots: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_fanout: 10,
            concurrency: 8,
            read_timeout_ms: 10_000,
            max_attempts: 3,
            retry_base_ms: 1_000,
            max_rejected_slots: 10,
        }
    }
}

impl FetchConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, base: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_ms = base.as_millis() as u64;
        self
    }

    pub fn with_rejected_slot_budget(mut self, slots: usize) -> Self {
        self.max_rejected_slots = slots;
        self
    }

    /// Child slots probed per parent, whatever the ledger claims
    pub fn slot_budget(&self, max_fanout: usize, direct_referrals: u32) -> u32 {
        let budget = max_fanout.saturating_add(self.max_rejected_slots);
        u32::try_from(budget).unwrap_or(u32::MAX).min(direct_referrals)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("fetch.concurrency must be at least 1"));
        }
        if self.read_timeout_ms == 0 {
            return Err(invalid("fetch.read_timeout_ms must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("fetch.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    /// Entries beyond this are evicted oldest fetch first
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            max_entries: 256,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(invalid("cache.ttl_ms must be positive"));
        }
        if self.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// POLLING
// ============================================================================

/// Polling cadence per scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub active_interval_ms: u64,
    pub inactive_interval_ms: u64,
    pub background_interval_ms: u64,
    /// No input for this long moves Active to Inactive
    pub idle_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 5_000,
            inactive_interval_ms: 30_000,
            background_interval_ms: 60_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn inactive_interval(&self) -> Duration {
        Duration::from_millis(self.inactive_interval_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Intervals rescaled so `active` becomes `base`, keeping the ratios.
    pub fn scaled_to(&self, base: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        let active = self.active_interval_ms.max(1);
        let scale = |ms: u64| ((ms as u128 * base_ms as u128) / active as u128).max(1) as u64;
        Self {
            active_interval_ms: base_ms,
            inactive_interval_ms: scale(self.inactive_interval_ms),
            background_interval_ms: scale(self.background_interval_ms),
            idle_timeout_ms: self.idle_timeout_ms,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.active_interval_ms == 0 || self.inactive_interval_ms == 0 || self.background_interval_ms == 0 {
            return Err(invalid("polling intervals must be positive"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(invalid("polling.idle_timeout_ms must be positive"));
        }
        if self.active_interval_ms > self.background_interval_ms {
            return Err(invalid("polling.active_interval_ms must not exceed background_interval_ms"));
        }
        Ok(())
    }
}

// ============================================================================
// LIVE EVENT STREAM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Delay before the first reconnect; doubles per attempt
    pub reconnect_base_ms: u64,
    /// Reconnect attempts before the channel is considered degraded
    pub max_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_base_ms: 5_000,
            max_retries: 5,
        }
    }
}

impl StreamConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.reconnect_base_ms.saturating_mul(1u64 << exp))
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// ============================================================================
// PER-SUBSCRIBER OPTIONS
// ============================================================================

/// Options a consumer passes to `NetworkSyncEngine::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeConfig {
    /// Open the live event channel for this root
    pub use_live_fallback: bool,
    /// Rescales the polling intervals so Active polls at this rate
    pub base_interval: Option<Duration>,
    /// Falls back to `FetchConfig::max_depth`
    pub max_depth: Option<u32>,
    /// Falls back to `FetchConfig::max_fanout`
    pub max_fanout: Option<usize>,
    pub include_inactive: bool,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            use_live_fallback: true,
            base_interval: None,
            max_depth: None,
            max_fanout: None,
            include_inactive: true,
        }
    }
}

impl SubscribeConfig {
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_max_fanout(mut self, fanout: usize) -> Self {
        self.max_fanout = Some(fanout);
        self
    }

    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = Some(interval);
        self
    }

    pub fn live_fallback(mut self, enabled: bool) -> Self {
        self.use_live_fallback = enabled;
        self
    }

    pub fn include_inactive(mut self, include: bool) -> Self {
        self.include_inactive = include;
        self
    }
}
