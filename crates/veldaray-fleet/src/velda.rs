//! CLI-backed fleet client.
//!
//! Velda's public surface is its CLI: `vrun` starts sessions, `velda`
//! lists, kills, and tags them. A Ray node is a long-lived session kept
//! alive with `sleep inf`; the session id doubles as the instance id.
//!
//! Command shapes:
//!
//! ```text
//! vrun -P <pool> --new-session --keep-alive --tty=no --tags=k=v,... -q \
//!     [-s <cluster>] sh -c 'hostname; sleep inf&'
//! velda ls -o json
//! velda kill --session-id <id>
//! velda set-tag --session-id <id> --tags=k=v,...
//! ```
//!
//! Velda has no native idempotency keys, so `create_instance` first looks
//! for an existing session carrying the spec's launch token tag and returns
//! it instead of spawning a second session.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::client::{FleetClient, ListFilter};
use crate::error::{FleetError, FleetResult};
use crate::tags::{TAG_CLUSTER_NAME, TAG_LAUNCH_TOKEN, TAG_NODE_KIND};
use crate::types::{InstanceId, InstanceRecord, InstanceSpec, InstanceStatus, NodeKind};

/// Fleet client that drives the `vrun` / `velda` binaries.
#[derive(Debug, Clone)]
pub struct VeldaFleet {
    /// Per-call deadline; exceeding it surfaces as `Unavailable`.
    timeout: Duration,
}

impl Default for VeldaFleet {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl VeldaFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a CLI command, capturing stdout. Spawn failures, timeouts, and
    /// non-zero exits map into the fleet error taxonomy.
    async fn run(&self, argv: &[String]) -> FleetResult<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FleetError::InvalidArgument("empty command".to_string()))?;

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| FleetError::Unavailable(format!("{program} timed out")))?
        .map_err(|e| FleetError::Unavailable(format!("failed to spawn {program}: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("not found") || lowered.contains("no such session") {
            Err(FleetError::NotFound(stderr))
        } else if lowered.contains("invalid") || lowered.contains("unknown flag") {
            Err(FleetError::InvalidArgument(stderr))
        } else {
            warn!(%program, %stderr, "fleet command failed");
            Err(FleetError::Unavailable(stderr))
        }
    }
}

#[async_trait]
impl FleetClient for VeldaFleet {
    async fn create_instance(&self, spec: &InstanceSpec) -> FleetResult<InstanceId> {
        spec.validate().map_err(FleetError::InvalidArgument)?;

        // Emulated idempotency: a session already carrying this launch
        // token is the first create's result.
        let existing = self
            .list_instances(&ListFilter::default())
            .await?
            .into_iter()
            .find(|r| r.tags.get(TAG_LAUNCH_TOKEN) == Some(&spec.launch_token));
        if let Some(record) = existing {
            debug!(
                instance_id = %record.instance_id,
                token = %spec.launch_token,
                "create resolved to existing session"
            );
            return Ok(record.instance_id);
        }

        let argv = create_argv(spec);
        let stdout = self.run(&argv).await?;
        let session_id = stdout.trim().to_string();
        if session_id.is_empty() {
            return Err(FleetError::Malformed(
                "vrun returned no session id".to_string(),
            ));
        }
        debug!(instance_id = %session_id, cluster = %spec.cluster_name, "session created");
        Ok(session_id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> FleetResult<()> {
        let argv = kill_argv(instance_id);
        self.run(&argv).await?;
        debug!(%instance_id, "session killed");
        Ok(())
    }

    async fn list_instances(&self, filter: &ListFilter) -> FleetResult<Vec<InstanceRecord>> {
        let argv = ls_argv();
        let stdout = self.run(&argv).await?;
        let listing: SessionListing = serde_json::from_str(&stdout)
            .map_err(|e| FleetError::Malformed(format!("velda ls output: {e}")))?;

        let records = listing
            .sessions
            .into_iter()
            .filter_map(session_to_record)
            .filter(|r| match &filter.cluster {
                Some(cluster) => r.tags.get(TAG_CLUSTER_NAME) == Some(cluster),
                None => true,
            })
            .collect();
        Ok(records)
    }

    async fn get_tags(&self, instance_id: &str) -> FleetResult<HashMap<String, String>> {
        // The CLI has no per-session tag query; resolve through the listing.
        let records = self.list_instances(&ListFilter::default()).await?;
        records
            .into_iter()
            .find(|r| r.instance_id == instance_id)
            .map(|r| r.tags)
            .ok_or_else(|| FleetError::NotFound(instance_id.to_string()))
    }

    async fn set_tags(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> FleetResult<()> {
        let argv = set_tag_argv(instance_id, tags);
        self.run(&argv).await?;
        Ok(())
    }
}

// ── Wire format ───────────────────────────────────────────────────

/// Shape of `velda ls -o json`.
#[derive(Debug, Deserialize)]
struct SessionListing {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct Session {
    session_id: String,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    internal_ip_address: Option<String>,
    #[serde(default)]
    external_ip_address: Option<String>,
    #[serde(default)]
    created_at: Option<u64>,
}

/// Turn a session entry into an `InstanceRecord`. Sessions without the
/// node-kind tag are other Velda workloads and yield `None`.
fn session_to_record(session: Session) -> Option<InstanceRecord> {
    let kind = NodeKind::parse(session.tags.get(TAG_NODE_KIND)?.as_str())?;
    let cluster_name = session
        .tags
        .get(TAG_CLUSTER_NAME)
        .cloned()
        .unwrap_or_default();
    let node_id = session
        .tags
        .get(crate::tags::TAG_NODE_ID)
        .cloned()
        // Sessions created before this provider tagged node ids fall back
        // to the session id, which is equally stable.
        .unwrap_or_else(|| session.session_id.clone());

    let status = match session.state.as_deref() {
        Some("pending") | Some("starting") => InstanceStatus::Pending,
        Some("running") => InstanceStatus::Running,
        Some("terminating") | Some("stopping") => InstanceStatus::Terminating,
        Some("terminated") | Some("stopped") => InstanceStatus::Terminated,
        // Listed but with no recognizable state: alive as far as the
        // platform is concerned.
        None => InstanceStatus::Running,
        Some(other) => {
            debug!(state = %other, session_id = %session.session_id, "unrecognized session state");
            InstanceStatus::Unknown
        }
    };

    Some(InstanceRecord {
        instance_id: session.session_id,
        node_id,
        cluster_name,
        kind,
        status,
        internal_address: session.internal_ip_address,
        external_address: session.external_ip_address,
        tags: session.tags,
        created_at: session.created_at.unwrap_or_else(epoch_secs),
        terminated_at: None,
    })
}

// ── Command construction ──────────────────────────────────────────

fn merged_tags(tags: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(",")
}

fn create_argv(spec: &InstanceSpec) -> Vec<String> {
    let mut argv = vec![
        "vrun".to_string(),
        "-P".to_string(),
        spec.pool.clone(),
        "--new-session".to_string(),
        "--keep-alive".to_string(),
        "--tty=no".to_string(),
        format!("--tags={}", merged_tags(&spec.tags)),
        "-q".to_string(),
    ];
    // Head sessions are named after the cluster so dashboard/job-submission
    // routing can address them.
    if spec.kind == NodeKind::Head {
        argv.push("-s".to_string());
        argv.push(crate::tags::cluster_tag_value(&spec.cluster_name));
    }
    argv.extend(
        ["sh", "-c", "hostname; sleep inf&"]
            .iter()
            .map(|s| s.to_string()),
    );
    argv
}

fn ls_argv() -> Vec<String> {
    ["velda", "ls", "-o", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn kill_argv(instance_id: &str) -> Vec<String> {
    vec![
        "velda".to_string(),
        "kill".to_string(),
        "--session-id".to_string(),
        instance_id.to_string(),
    ]
}

fn set_tag_argv(instance_id: &str, tags: &HashMap<String, String>) -> Vec<String> {
    vec![
        "velda".to_string(),
        "set-tag".to_string(),
        "--session-id".to_string(),
        instance_id.to_string(),
        format!("--tags={}", merged_tags(tags)),
    ]
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::creation_tags;

    fn worker_spec() -> InstanceSpec {
        InstanceSpec {
            cluster_name: "demo".to_string(),
            kind: NodeKind::Worker,
            pool: "shell".to_string(),
            tags: creation_tags("demo", NodeKind::Worker, "w-1", "tok-1"),
            launch_token: "tok-1".to_string(),
        }
    }

    #[test]
    fn create_argv_for_worker_has_no_session_name() {
        let argv = create_argv(&worker_spec());
        assert_eq!(argv[0], "vrun");
        assert!(argv.contains(&"--new-session".to_string()));
        assert!(argv.contains(&"--keep-alive".to_string()));
        assert!(!argv.contains(&"-s".to_string()));
        assert_eq!(
            argv[argv.len() - 3..].to_vec(),
            vec!["sh", "-c", "hostname; sleep inf&"]
        );
    }

    #[test]
    fn create_argv_for_head_names_the_session_after_the_cluster() {
        let mut spec = worker_spec();
        spec.kind = NodeKind::Head;
        spec.tags = creation_tags("demo", NodeKind::Head, "h-1", "tok-2");

        let argv = create_argv(&spec);
        let pos = argv.iter().position(|a| a == "-s").unwrap();
        assert_eq!(argv[pos + 1], "ray-demo");
    }

    #[test]
    fn create_argv_merges_tags_sorted() {
        let argv = create_argv(&worker_spec());
        let tags_arg = argv.iter().find(|a| a.starts_with("--tags=")).unwrap();
        assert!(tags_arg.contains("ray-cluster-name=ray-demo"));
        assert!(tags_arg.contains("ray-node-type=worker"));
        assert!(tags_arg.contains("ray-node-id=w-1"));
    }

    #[test]
    fn kill_argv_targets_the_session() {
        assert_eq!(
            kill_argv("sess-9"),
            vec!["velda", "kill", "--session-id", "sess-9"]
        );
    }

    #[test]
    fn parses_ls_output_and_skips_untagged_sessions() {
        let json = r#"{
            "sessions": [
                {
                    "session_id": "sess-1",
                    "state": "running",
                    "internal_ip_address": "10.0.0.5",
                    "tags": {
                        "ray-node-type": "worker",
                        "ray-cluster-name": "ray-demo",
                        "ray-node-id": "w-1"
                    }
                },
                {"session_id": "sess-2", "tags": {"owner": "someone-else"}}
            ]
        }"#;
        let listing: SessionListing = serde_json::from_str(json).unwrap();
        let records: Vec<_> = listing
            .sessions
            .into_iter()
            .filter_map(session_to_record)
            .collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_id, "sess-1");
        assert_eq!(records[0].node_id, "w-1");
        assert_eq!(records[0].status, InstanceStatus::Running);
        assert_eq!(records[0].internal_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn session_without_state_counts_as_running() {
        let json = r#"{"sessions": [{
            "session_id": "sess-3",
            "tags": {"ray-node-type": "head", "ray-cluster-name": "ray-demo"}
        }]}"#;
        let listing: SessionListing = serde_json::from_str(json).unwrap();
        let record = listing
            .sessions
            .into_iter()
            .filter_map(session_to_record)
            .next()
            .unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
        // No node-id tag: session id is the fallback.
        assert_eq!(record.node_id, "sess-3");
    }

    #[test]
    fn unrecognized_state_maps_to_unknown() {
        let json = r#"{"sessions": [{
            "session_id": "sess-4",
            "state": "hibernating",
            "tags": {"ray-node-type": "worker"}
        }]}"#;
        let listing: SessionListing = serde_json::from_str(json).unwrap();
        let record = listing
            .sessions
            .into_iter()
            .filter_map(session_to_record)
            .next()
            .unwrap();
        assert_eq!(record.status, InstanceStatus::Unknown);
    }
}
