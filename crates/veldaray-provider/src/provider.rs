//! The node provider contract and its Velda-backed implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use veldaray_fleet::tags::{
    TAG_NODE_KIND, cluster_tag_value, endpoint_host, is_immutable_key, matches_filters,
};
use veldaray_fleet::{FleetClient, InstanceStatus, NodeId, NodeKind};
use veldaray_reconciler::Reconciler;
use veldaray_registry::Registry;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};

/// The contract the autoscaler consumes.
///
/// All operations are safe to call repeatedly with the same arguments:
/// reads are idempotent by construction, creates are idempotent per launch
/// token, and terminating an already-gone node is a successful no-op.
/// Reads never block on the network; they serve the cached registry view,
/// possibly stale by up to one refresh interval.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Create `count` nodes carrying the given autoscaler tags (which must
    /// include the node-kind tag). Returns the new logical node ids.
    async fn create_node(
        &self,
        tags: &HashMap<String, String>,
        count: u32,
    ) -> ProviderResult<Vec<NodeId>>;

    /// Terminate one node. Succeeds if the node is already gone.
    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()>;

    /// Terminate several nodes, stopping at the first hard failure.
    async fn terminate_nodes(&self, node_ids: &[String]) -> ProviderResult<()>;

    /// Ids of all live nodes in this cluster matching every tag filter.
    /// This is the autoscaler's poll point and drives the registry refresh.
    async fn non_terminated_nodes(
        &self,
        tag_filters: &HashMap<String, String>,
    ) -> ProviderResult<Vec<NodeId>>;

    /// Apply tags to a node. Identity tags (cluster, kind, node id) are
    /// immutable; attempting to change them is an error.
    async fn set_node_tags(
        &self,
        node_id: &str,
        tags: &HashMap<String, String>,
    ) -> ProviderResult<()>;

    /// Cached tag set of a node, if known.
    fn node_tags(&self, node_id: &str) -> Option<HashMap<String, String>>;

    /// Cached internal address, if the platform has reported one.
    fn internal_ip(&self, node_id: &str) -> Option<String>;

    /// Cached external address, if any. Velda sessions are reached through
    /// the platform ingress, so this is typically `None`.
    fn external_ip(&self, node_id: &str) -> Option<String>;

    /// Whether the node is confirmed running.
    fn is_running(&self, node_id: &str) -> bool;

    /// Whether the node is terminated (or was never known).
    fn is_terminated(&self, node_id: &str) -> bool;

    /// Reverse lookup of a node id from its internal address.
    fn node_id_by_internal_ip(&self, ip: &str) -> Option<NodeId>;
}

/// Node provider backed by the Velda fleet.
///
/// Constructed per cluster context and passed around explicitly; owns its
/// registry and reconciler rather than sharing process-wide state.
pub struct VeldaNodeProvider {
    config: ProviderConfig,
    /// Platform-side cluster tag value (`ray-` prefixed).
    cluster_tag: String,
    registry: Arc<Registry>,
    reconciler: Reconciler,
    last_refresh: Mutex<Option<Instant>>,
}

impl VeldaNodeProvider {
    pub fn new(config: ProviderConfig, fleet: Arc<dyn FleetClient>) -> Self {
        let registry = Arc::new(
            Registry::new(fleet.clone()).with_eviction_grace(config.eviction_grace),
        );
        let reconciler = Reconciler::new(fleet, registry.clone())
            .with_retry(config.retry.clone())
            .with_call_timeout(config.call_timeout)
            .with_pool(config.pool.clone())
            .with_node_prefix(config.node_prefix.clone());
        let cluster_tag = cluster_tag_value(&config.cluster_name);

        Self {
            config,
            cluster_tag,
            registry,
            reconciler,
            last_refresh: Mutex::new(None),
        }
    }

    /// Shared handle to the underlying registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Hostname at which a node's service port is reachable through the
    /// platform ingress, per the fixed `port-role-cluster-instance.domain`
    /// addressing convention (e.g. the head node's dashboard).
    pub fn service_host(&self, node_id: &str, port: u16, domain: &str) -> Option<String> {
        self.registry.get(node_id).map(|r| {
            endpoint_host(port, r.kind, &self.config.cluster_name, &r.instance_id, domain)
        })
    }

    /// Refresh the registry unless one happened within the configured
    /// interval. A failed refresh is logged and the stale cache served;
    /// eventual consistency is a normal state, not an error.
    async fn maybe_refresh(&self) {
        {
            let last = self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last
                && at.elapsed() < self.config.refresh_interval
            {
                return;
            }
        }

        match self.registry.refresh(&self.cluster_tag).await {
            Ok(outcome) => {
                debug!(
                    observed = outcome.observed,
                    terminated = outcome.terminated.len(),
                    evicted = outcome.evicted.len(),
                    "registry refreshed"
                );
                let mut last = self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
                *last = Some(Instant::now());
            }
            Err(e) => {
                warn!(error = %e, "registry refresh failed, serving cached view");
            }
        }
    }

    fn kind_from_tags(tags: &HashMap<String, String>) -> ProviderResult<NodeKind> {
        let value = tags.get(TAG_NODE_KIND).ok_or_else(|| {
            ProviderError::InvalidArgument(format!("missing {TAG_NODE_KIND} tag"))
        })?;
        NodeKind::parse(value).ok_or_else(|| {
            ProviderError::InvalidArgument(format!("unknown node kind {value:?}"))
        })
    }
}

#[async_trait]
impl NodeProvider for VeldaNodeProvider {
    async fn create_node(
        &self,
        tags: &HashMap<String, String>,
        count: u32,
    ) -> ProviderResult<Vec<NodeId>> {
        let kind = Self::kind_from_tags(tags)?;

        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let node_id = self
                .reconciler
                .create_node(&self.config.cluster_name, kind, tags)
                .await?;
            created.push(node_id);
        }
        Ok(created)
    }

    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()> {
        self.reconciler.terminate_node(node_id).await?;
        Ok(())
    }

    async fn terminate_nodes(&self, node_ids: &[String]) -> ProviderResult<()> {
        for node_id in node_ids {
            self.terminate_node(node_id).await?;
        }
        Ok(())
    }

    async fn non_terminated_nodes(
        &self,
        tag_filters: &HashMap<String, String>,
    ) -> ProviderResult<Vec<NodeId>> {
        self.maybe_refresh().await;

        let nodes = self
            .registry
            .list_non_terminated(&self.cluster_tag)
            .into_iter()
            .filter(|r| matches_filters(&r.tags, tag_filters))
            .map(|r| r.node_id)
            .collect();
        Ok(nodes)
    }

    async fn set_node_tags(
        &self,
        node_id: &str,
        tags: &HashMap<String, String>,
    ) -> ProviderResult<()> {
        let record = self.registry.get(node_id).ok_or_else(|| {
            ProviderError::InvalidArgument(format!("unknown node {node_id}"))
        })?;

        for (key, value) in tags {
            if is_immutable_key(key) && record.tags.get(key) != Some(value) {
                return Err(ProviderError::InvalidArgument(format!(
                    "tag {key} is immutable; terminate and recreate to change it"
                )));
            }
        }

        self.reconciler.set_tags(&record.instance_id, tags).await?;

        let mut merged = record.tags;
        merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.registry.update_tags(node_id, merged);
        Ok(())
    }

    fn node_tags(&self, node_id: &str) -> Option<HashMap<String, String>> {
        self.registry.get(node_id).map(|r| r.tags)
    }

    fn internal_ip(&self, node_id: &str) -> Option<String> {
        self.registry.get(node_id).and_then(|r| r.internal_address)
    }

    fn external_ip(&self, node_id: &str) -> Option<String> {
        self.registry.get(node_id).and_then(|r| r.external_address)
    }

    fn is_running(&self, node_id: &str) -> bool {
        self.registry
            .get(node_id)
            .is_some_and(|r| r.status == InstanceStatus::Running)
    }

    fn is_terminated(&self, node_id: &str) -> bool {
        // A node we have never heard of is as terminated as one we watched
        // go down.
        self.registry.get(node_id).is_none_or(|r| !r.status.is_live())
    }

    fn node_id_by_internal_ip(&self, ip: &str) -> Option<NodeId> {
        self.registry.find_by_internal_ip(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veldaray_fleet::FakeFleet;
    use veldaray_fleet::tags::{TAG_CLUSTER_NAME, creation_tags};
    use veldaray_reconciler::RetryPolicy;

    fn test_provider() -> (Arc<FakeFleet>, VeldaNodeProvider) {
        let fleet = Arc::new(FakeFleet::new());
        let config = ProviderConfig::new("demo")
            .with_refresh_interval(Duration::ZERO)
            .with_retry(RetryPolicy::fast(3));
        let provider = VeldaNodeProvider::new(config, fleet.clone());
        (fleet, provider)
    }

    fn worker_tags() -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert(TAG_NODE_KIND.to_string(), "worker".to_string());
        tags
    }

    #[tokio::test]
    async fn create_node_requires_a_kind_tag() {
        let (_, provider) = test_provider();
        let err = provider.create_node(&HashMap::new(), 1).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn create_node_rejects_unknown_kind() {
        let (_, provider) = test_provider();
        let mut tags = HashMap::new();
        tags.insert(TAG_NODE_KIND.to_string(), "gpu".to_string());

        let err = provider.create_node(&tags, 1).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn create_count_produces_distinct_nodes() {
        let (fleet, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 3).await.unwrap();

        assert_eq!(ids.len(), 3);
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(fleet.instance_count(), 3);
    }

    #[tokio::test]
    async fn created_nodes_are_visible_before_any_refresh() {
        let (fleet, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 1).await.unwrap();

        // No platform listing has happened yet; the optimistic registry
        // entry makes the node visible immediately.
        let listed_before = fleet.list_calls();
        assert!(provider.node_tags(&ids[0]).is_some());
        assert_eq!(fleet.list_calls(), listed_before);
        assert!(!provider.is_terminated(&ids[0]));
    }

    #[tokio::test]
    async fn non_terminated_nodes_applies_tag_filters() {
        let (_, provider) = test_provider();
        provider.create_node(&worker_tags(), 2).await.unwrap();

        let mut head_tags = HashMap::new();
        head_tags.insert(TAG_NODE_KIND.to_string(), "head".to_string());
        provider.create_node(&head_tags, 1).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert(TAG_NODE_KIND.to_string(), "worker".to_string());
        let workers = provider.non_terminated_nodes(&filter).await.unwrap();
        assert_eq!(workers.len(), 2);

        let all = provider.non_terminated_nodes(&HashMap::new()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn non_terminated_nodes_excludes_other_clusters() {
        let (fleet, provider) = test_provider();
        provider.create_node(&worker_tags(), 1).await.unwrap();

        // An instance from an unrelated cluster on the same platform.
        let spec = veldaray_fleet::InstanceSpec {
            cluster_name: "other".to_string(),
            kind: NodeKind::Worker,
            pool: "shell".to_string(),
            tags: creation_tags("other", NodeKind::Worker, "x-1", "tok-x"),
            launch_token: "tok-x".to_string(),
        };
        fleet.create_instance(&spec).await.unwrap();

        let nodes = provider.non_terminated_nodes(&HashMap::new()).await.unwrap();
        assert_eq!(nodes.len(), 1);
        let tags = provider.node_tags(&nodes[0]).unwrap();
        assert_eq!(tags.get(TAG_CLUSTER_NAME).unwrap(), "ray-demo");
    }

    #[tokio::test]
    async fn terminated_nodes_disappear_from_queries() {
        let (_, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 1).await.unwrap();

        provider.terminate_node(&ids[0]).await.unwrap();

        assert!(provider.is_terminated(&ids[0]));
        assert!(!provider.is_running(&ids[0]));
        let nodes = provider.non_terminated_nodes(&HashMap::new()).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn terminate_nodes_handles_the_batch() {
        let (fleet, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 3).await.unwrap();

        provider.terminate_nodes(&ids).await.unwrap();
        assert_eq!(fleet.instance_count(), 0);
        for id in &ids {
            assert!(provider.is_terminated(id));
        }
    }

    #[tokio::test]
    async fn unknown_node_reads_are_absent_and_terminated() {
        let (_, provider) = test_provider();
        assert!(provider.node_tags("ghost").is_none());
        assert!(provider.internal_ip("ghost").is_none());
        assert!(provider.external_ip("ghost").is_none());
        assert!(!provider.is_running("ghost"));
        assert!(provider.is_terminated("ghost"));
    }

    #[tokio::test]
    async fn set_node_tags_rejects_identity_mutation() {
        let (_, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 1).await.unwrap();

        let mut tags = HashMap::new();
        tags.insert(TAG_NODE_KIND.to_string(), "head".to_string());
        let err = provider.set_node_tags(&ids[0], &tags).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn set_node_tags_merges_mutable_tags() {
        let (fleet, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 1).await.unwrap();

        let mut tags = HashMap::new();
        tags.insert("ray-node-status".to_string(), "up-to-date".to_string());
        provider.set_node_tags(&ids[0], &tags).await.unwrap();

        let cached = provider.node_tags(&ids[0]).unwrap();
        assert_eq!(cached.get("ray-node-status").unwrap(), "up-to-date");
        assert_eq!(cached.get(TAG_NODE_KIND).unwrap(), "worker");

        // The platform saw the same update.
        let instance_id = provider.registry().get(&ids[0]).unwrap().instance_id;
        let remote = fleet.get_tags(&instance_id).await.unwrap();
        assert_eq!(remote.get("ray-node-status").unwrap(), "up-to-date");
    }

    #[tokio::test]
    async fn service_host_follows_the_addressing_convention() {
        let (_, provider) = test_provider();
        let ids = provider.create_node(&worker_tags(), 1).await.unwrap();
        let instance_id = provider.registry().get(&ids[0]).unwrap().instance_id;

        let host = provider.service_host(&ids[0], 8265, "velda.io").unwrap();
        assert_eq!(host, format!("8265-worker-ray-demo-{instance_id}.velda.io"));
        assert!(provider.service_host("ghost", 8265, "velda.io").is_none());
    }

    #[tokio::test]
    async fn refresh_rate_limit_serves_cached_view() {
        let fleet = Arc::new(FakeFleet::new());
        let config = ProviderConfig::new("demo")
            .with_refresh_interval(Duration::from_secs(3600))
            .with_retry(RetryPolicy::fast(3));
        let provider = VeldaNodeProvider::new(config, fleet.clone());
        provider.create_node(&worker_tags(), 1).await.unwrap();

        provider.non_terminated_nodes(&HashMap::new()).await.unwrap();
        let after_first = fleet.list_calls();
        provider.non_terminated_nodes(&HashMap::new()).await.unwrap();
        provider.non_terminated_nodes(&HashMap::new()).await.unwrap();

        assert_eq!(fleet.list_calls(), after_first);
    }
}
