//! Provider configuration.
//!
//! The autoscaler hands the provider an already-validated desired-state
//! document; the fields here are its provider section. Parsing and schema
//! validation of the enclosing cluster YAML happen upstream.

use std::time::Duration;

use serde::Deserialize;

use veldaray_reconciler::RetryPolicy;

/// Configuration for a [`VeldaNodeProvider`](crate::VeldaNodeProvider),
/// scoped to one cluster context.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Logical cluster name; tagged onto every instance (with a `ray-`
    /// platform prefix).
    pub cluster_name: String,
    /// Velda pool instances are allocated from.
    pub pool: String,
    /// Prefix for generated node ids.
    pub node_prefix: String,
    /// Minimum interval between registry refreshes; tighter autoscaler
    /// polls serve the cached view.
    pub refresh_interval: Duration,
    /// How long terminated records stay queryable before eviction.
    pub eviction_grace: Duration,
    /// Per-call fleet deadline.
    pub call_timeout: Duration,
    /// Retry policy around every fleet call.
    pub retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            pool: "shell".to_string(),
            node_prefix: "ray-worker".to_string(),
            refresh_interval: Duration::from_secs(5),
            eviction_grace: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProviderConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    /// Set the Velda pool.
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Set the minimum registry refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
