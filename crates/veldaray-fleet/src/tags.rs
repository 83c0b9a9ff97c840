//! Tag & naming scheme.
//!
//! Deterministic derivation of fleet-visible labels. Every component filters
//! and reconciles by these keys, so they are defined once here. The key names
//! follow the Ray autoscaler's public tag conventions; the launch token tag
//! is what makes creation idempotent on a platform without native
//! idempotency keys.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::NodeKind;

/// Node role tag (`head` / `worker`). The autoscaler sets and filters on
/// this key; an instance without it is not a Ray node.
pub const TAG_NODE_KIND: &str = "ray-node-type";

/// Cluster ownership tag.
pub const TAG_CLUSTER_NAME: &str = "ray-cluster-name";

/// Logical node id tag, generated by this system at creation.
pub const TAG_NODE_ID: &str = "ray-node-id";

/// Idempotency token tag. Two creates carrying the same token resolve to
/// the same instance.
pub const TAG_LAUNCH_TOKEN: &str = "ray-launch-token";

/// Cluster names are namespaced on the platform so Ray sessions are
/// distinguishable from other Velda workloads.
pub fn cluster_tag_value(cluster_name: &str) -> String {
    format!("ray-{cluster_name}")
}

/// Generate a fresh logical node id: `{prefix}-{8 hex chars}`.
///
/// Uniqueness comes from hashing a process-wide counter together with the
/// current time; ids are never reused for a different instance.
pub fn generate_node_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    prefix.hash(&mut hasher);
    format!("{prefix}-{:08x}", hasher.finish() as u32)
}

/// Derive the launch token for a node id. The token is stable per node id,
/// so internal retries of the same create reuse it.
pub fn launch_token_for(node_id: &str) -> String {
    format!("launch-{node_id}")
}

/// The tag set applied atomically at instance creation.
pub fn creation_tags(
    cluster_name: &str,
    kind: NodeKind,
    node_id: &str,
    launch_token: &str,
) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    tags.insert(TAG_CLUSTER_NAME.to_string(), cluster_tag_value(cluster_name));
    tags.insert(TAG_NODE_KIND.to_string(), kind.as_str().to_string());
    tags.insert(TAG_NODE_ID.to_string(), node_id.to_string());
    tags.insert(TAG_LAUNCH_TOKEN.to_string(), launch_token.to_string());
    tags
}

/// Conjunctive tag filter match, the shape `non_terminated_nodes` uses.
/// An empty filter matches everything.
pub fn matches_filters(tags: &HashMap<String, String>, filters: &HashMap<String, String>) -> bool {
    filters
        .iter()
        .all(|(k, v)| tags.get(k).map(String::as_str) == Some(v.as_str()))
}

/// Tag keys that are set at creation and never mutated afterwards.
/// Role changes require terminate + recreate, never in-place edits.
pub fn is_immutable_key(key: &str) -> bool {
    matches!(key, TAG_CLUSTER_NAME | TAG_NODE_KIND | TAG_NODE_ID | TAG_LAUNCH_TOKEN)
}

/// Hostname for the platform's fixed `port-role-cluster-instance.domain`
/// addressing convention. Routing itself is external; this core only has to
/// tag instances consistently enough for the convention to resolve.
pub fn endpoint_host(
    port: u16,
    kind: NodeKind,
    cluster_name: &str,
    instance_id: &str,
    domain: &str,
) -> String {
    format!(
        "{port}-{}-{}-{instance_id}.{domain}",
        kind.as_str(),
        cluster_tag_value(cluster_name)
    )
}
