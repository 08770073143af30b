// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-instance configuration and metrics shared by all components
//! (spec §6 Configuration), bundled the way `consensus-core`'s `Context`
//! bundles `Parameters` + `Metrics`.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

use crate::metrics::Metrics;

#[derive(Clone, Debug)]
pub struct FailoverOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1500),
            exponential_backoff: true,
        }
    }
}

/// Bounded-concurrency limits for the two task queues (spec §4.3).
#[derive(Clone, Copy, Debug)]
pub struct QueueLimits {
    pub build_concurrency: usize,
    pub repair_concurrency: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            build_concurrency: 2,
            repair_concurrency: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_tx_limit: u64,
    pub max_cache_size_bytes: u64,
    pub ws_timeout: Duration,
    pub ws_extend_timeout: Duration,
    /// Clamp on a single notification timer sleep (spec §4.7).
    pub max_timer_duration: Duration,
    pub failover_options: FailoverOptions,
    pub queue_limits: QueueLimits,
    pub enable_logging: bool,
    pub enable_timer: bool,
    pub max_items_per_key: usize,
    pub max_subscriptions: usize,
    pub global_metadata_cache_limit: usize,
    pub memory_cache_ttl: Duration,
    pub memory_cache_ttl_extension: Duration,
    pub memory_sweep_interval: Duration,
    /// Throttle write-back to every Nth build iteration once a subject's
    /// working set grows past this size (spec §4.8.2, most recent
    /// version's threshold per spec.md REDESIGN FLAGS).
    pub large_subject_threshold: usize,
    pub large_subject_write_throttle: usize,
    /// Tunable, not a contract (spec.md REDESIGN FLAGS): probability that
    /// `repairPage` recomputes and compares the content hash.
    pub hash_check_probability: f64,
    /// Debounce window for coalescing notification-triggered repairs
    /// (spec §4.8.5).
    pub update_debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_tx_limit: 10_000,
            max_cache_size_bytes: 512 * 1024 * 1024,
            ws_timeout: Duration::from_secs(12 * 3600),
            ws_extend_timeout: Duration::from_secs(30 * 60),
            max_timer_duration: Duration::from_secs(15 * 24 * 3600),
            failover_options: FailoverOptions::default(),
            queue_limits: QueueLimits::default(),
            enable_logging: false,
            enable_timer: false,
            max_items_per_key: 10_000,
            max_subscriptions: 30,
            global_metadata_cache_limit: 10_000,
            memory_cache_ttl: Duration::from_secs(120),
            memory_cache_ttl_extension: Duration::from_secs(10),
            memory_sweep_interval: Duration::from_secs(10),
            large_subject_threshold: 2000,
            large_subject_write_throttle: 10,
            hash_check_probability: 0.5,
            update_debounce: Duration::from_millis(500),
        }
    }
}

/// Context shared by every component of one `ChronikCache` instance.
#[derive(Clone)]
pub struct Context {
    pub config: CacheConfig,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(config: CacheConfig) -> Self {
        let metrics = Arc::new(Metrics::new(&Registry::new()));
        Self { config, metrics }
    }

    pub fn with_registry(config: CacheConfig, registry: &Registry) -> Self {
        Self {
            config,
            metrics: Arc::new(Metrics::new(registry)),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self {
            config: CacheConfig::default(),
            metrics: Metrics::new_for_test(),
        }
    }

    #[cfg(test)]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }
}
