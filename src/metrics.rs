// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics, registered the way `consensus-core`'s `Context`
//! bundles an `Arc<Metrics>` shared by every component.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounterVec, IntGauge, Registry,
};

pub struct Metrics {
    pub history_requests: IntCounterVec,
    pub history_cache_hits: IntCounterVec,
    pub build_duration: Histogram,
    pub subjects_rejected: IntCounterVec,
    pub memory_cache_entries: IntGauge,
    pub active_subscriptions: IntGauge,
    pub subscription_evictions: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            history_requests: register_int_counter_vec_with_registry!(
                "chronik_cache_history_requests",
                "Number of history() calls by namespace",
                &["namespace"],
                registry,
            )
            .unwrap(),
            history_cache_hits: register_int_counter_vec_with_registry!(
                "chronik_cache_history_cache_hits",
                "Number of history() calls served from cache by namespace",
                &["namespace"],
                registry,
            )
            .unwrap(),
            build_duration: register_histogram_with_registry!(
                "chronik_cache_build_duration_seconds",
                "Time spent in updateCache build loops",
                registry,
            )
            .unwrap(),
            subjects_rejected: register_int_counter_vec_with_registry!(
                "chronik_cache_subjects_rejected",
                "Subjects transitioned to REJECT by namespace",
                &["namespace"],
                registry,
            )
            .unwrap(),
            memory_cache_entries: register_int_gauge_with_registry!(
                "chronik_cache_memory_cache_entries",
                "Entries currently resident in the two-tier memory cache",
                registry,
            )
            .unwrap(),
            active_subscriptions: register_int_gauge_with_registry!(
                "chronik_cache_active_subscriptions",
                "Live notification subscriptions across both namespaces",
                registry,
            )
            .unwrap(),
            subscription_evictions: register_int_counter_vec_with_registry!(
                "chronik_cache_subscription_evictions",
                "FIFO evictions of notification subscriptions by namespace",
                &["namespace"],
                registry,
            )
            .unwrap(),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
