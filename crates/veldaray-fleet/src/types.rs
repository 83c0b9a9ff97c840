//! Domain types shared across the node provider stack.
//!
//! An [`InstanceRecord`] is one fleet instance believed to back a logical
//! node. Records are produced by the fleet client (from `velda ls` output or
//! the fake backend) and cached by the registry, which is the only component
//! that mutates their status afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Stable logical identifier generated by this system at creation time.
/// The autoscaler refers to a node by this id for its whole lifetime;
/// an id is never reassigned to a different instance.
pub type NodeId = String;

/// Opaque identifier assigned by the fleet platform (a Velda session id).
pub type InstanceId = String;

/// Role of a node within a Ray cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Head,
    Worker,
}

impl NodeKind {
    /// Tag value used on the platform (`ray-node-type`).
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Head => "head",
            NodeKind::Worker => "worker",
        }
    }

    /// Parse a tag value back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "head" => Some(NodeKind::Head),
            "worker" => Some(NodeKind::Worker),
            _ => None,
        }
    }
}

/// Lifecycle status of a node-backing instance.
///
/// `Pending` and `Terminating` are transitional: they model the window
/// between a local create/terminate call and the platform confirming it.
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
    Unknown,
}

impl InstanceStatus {
    /// Whether this status is the absorbing terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }

    /// Whether the node should appear in non-terminated queries.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending | InstanceStatus::Running | InstanceStatus::Unknown
        )
    }
}

/// One fleet instance believed to back a logical node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    /// Platform-assigned instance (session) id, immutable once created.
    pub instance_id: InstanceId,
    /// Logical node id, generated at creation, never reused.
    pub node_id: NodeId,
    /// Cluster this node belongs to (tag-derived, immutable).
    pub cluster_name: String,
    /// Head or worker (tag-derived, immutable).
    pub kind: NodeKind,
    pub status: InstanceStatus,
    /// Internal network endpoint, once the platform reports one.
    pub internal_address: Option<String>,
    /// External network endpoint, if the platform exposes one.
    pub external_address: Option<String>,
    /// Full tag set, including the cluster/kind/node-id keys.
    pub tags: HashMap<String, String>,
    /// Unix timestamp (seconds) when the instance was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the transition to `Terminated`,
    /// used by the registry's eviction grace timer.
    pub terminated_at: Option<u64>,
}

/// Creation request handed to the fleet client.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub cluster_name: String,
    pub kind: NodeKind,
    /// Velda pool to allocate from.
    pub pool: String,
    /// Tags to apply atomically at creation.
    pub tags: HashMap<String, String>,
    /// Caller-supplied idempotency token; two creates with the same token
    /// produce at most one instance.
    pub launch_token: String,
}

impl InstanceSpec {
    /// Basic validity check, enforced by every backend before any side
    /// effect. Failures are `InvalidArgument` and never retried.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_name.is_empty() {
            return Err("cluster name is empty".to_string());
        }
        if self.pool.is_empty() {
            return Err("pool is empty".to_string());
        }
        if self.launch_token.is_empty() {
            return Err("launch token is empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_tag_value() {
        assert_eq!(NodeKind::parse(NodeKind::Head.as_str()), Some(NodeKind::Head));
        assert_eq!(
            NodeKind::parse(NodeKind::Worker.as_str()),
            Some(NodeKind::Worker)
        );
        assert_eq!(NodeKind::parse("gpu"), None);
    }

    #[test]
    fn terminated_is_the_only_terminal_status() {
        assert!(InstanceStatus::Terminated.is_terminal());
        assert!(!InstanceStatus::Terminating.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn transitional_and_running_statuses_are_live() {
        assert!(InstanceStatus::Pending.is_live());
        assert!(InstanceStatus::Running.is_live());
        assert!(InstanceStatus::Unknown.is_live());
        assert!(!InstanceStatus::Terminating.is_live());
        assert!(!InstanceStatus::Terminated.is_live());
    }

    #[test]
    fn spec_validation_rejects_empty_fields() {
        let spec = InstanceSpec {
            cluster_name: String::new(),
            kind: NodeKind::Worker,
            pool: "shell".to_string(),
            tags: HashMap::new(),
            launch_token: "tok".to_string(),
        };
        assert!(spec.validate().is_err());

        let spec = InstanceSpec {
            cluster_name: "demo".to_string(),
            pool: String::new(),
            ..spec
        };
        assert!(spec.validate().is_err());
    }
}
