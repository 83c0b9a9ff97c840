//! The fleet client contract.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::FleetResult;
use crate::types::{InstanceId, InstanceRecord, InstanceSpec};

/// Server-side filter for `list_instances`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    /// Restrict to instances tagged with this cluster (platform tag value,
    /// i.e. already `ray-` prefixed). `None` lists every Ray-tagged instance.
    pub cluster: Option<String>,
}

impl ListFilter {
    pub fn cluster(cluster_tag_value: impl Into<String>) -> Self {
        Self {
            cluster: Some(cluster_tag_value.into()),
        }
    }
}

/// Thin typed wrapper over the fleet platform's instance lifecycle API.
///
/// Implementations hold no local state and perform no retries; the
/// reconciler owns retry/backoff policy. All methods are safe to share
/// across tasks via `Arc<dyn FleetClient>`.
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Create an instance. Two calls carrying the same
    /// `spec.launch_token` produce at most one instance: the second call
    /// either returns the first-created id or fails with
    /// `FleetError::DuplicateRequest` naming it.
    async fn create_instance(&self, spec: &InstanceSpec) -> FleetResult<InstanceId>;

    /// Terminate an instance. `NotFound` if it no longer exists.
    async fn terminate_instance(&self, instance_id: &str) -> FleetResult<()>;

    /// List current instances matching the filter. Instances without the
    /// node-kind tag are not Ray nodes and are excluded.
    async fn list_instances(&self, filter: &ListFilter) -> FleetResult<Vec<InstanceRecord>>;

    /// Fetch the current tag set of an instance.
    async fn get_tags(&self, instance_id: &str) -> FleetResult<HashMap<String, String>>;

    /// Apply tags to an instance (merge semantics; existing keys are
    /// overwritten, others untouched).
    async fn set_tags(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> FleetResult<()>;
}
