//! The registry proper: refresh/merge semantics and status transitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use veldaray_fleet::client::ListFilter;
use veldaray_fleet::{FleetClient, InstanceRecord, InstanceStatus, NodeId};

use crate::error::RegistryResult;

/// What a single `refresh` call did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Instances observed in the fleet response.
    pub observed: usize,
    /// Node ids that transitioned to `Terminated` because they vanished
    /// from the platform. Each id appears here exactly once across the
    /// registry's lifetime.
    pub terminated: Vec<NodeId>,
    /// Node ids evicted after the post-termination grace period.
    pub evicted: Vec<NodeId>,
}

/// A cached record plus when it entered the cache. The admission instant
/// tells "absent from the listing because deleted" apart from "absent
/// because the listing snapshot predates it".
struct Entry {
    record: InstanceRecord,
    admitted_at: Instant,
    /// Whether any platform listing has confirmed this instance. Locally
    /// upserted records start unconfirmed and are exempt from deletion
    /// detection until the listing catches up.
    observed: bool,
}

/// Cached mapping from logical node id to last-known instance record.
///
/// The only component that mutates record status. All writes go through
/// `upsert` / `mark_terminating` / `mark_terminated` / `refresh`; the map
/// lock is held only for in-memory merge windows, never across a network
/// call.
pub struct Registry {
    fleet: Arc<dyn FleetClient>,
    nodes: RwLock<HashMap<NodeId, Entry>>,
    /// How long a `Terminated` record stays queryable before eviction,
    /// so in-flight status queries still resolve.
    eviction_grace: Duration,
    /// How long a `Pending` record may stay absent from the platform
    /// listing before that absence counts as a deletion. Covers the lag
    /// between an optimistic upsert and the listing catching up.
    creation_grace: Duration,
}

impl Registry {
    pub fn new(fleet: Arc<dyn FleetClient>) -> Self {
        Self {
            fleet,
            nodes: RwLock::new(HashMap::new()),
            eviction_grace: Duration::from_secs(300),
            creation_grace: Duration::from_secs(30),
        }
    }

    /// Set the eviction grace period for terminated records.
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    /// Set the grace period before an unlisted pending record counts as
    /// deleted.
    pub fn with_creation_grace(mut self, grace: Duration) -> Self {
        self.creation_grace = grace;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Entry>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Entry>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Pull the full current state for one cluster from the fleet and merge
    /// it into the cache. `cluster_tag` is the platform-side tag value
    /// (already `ray-` prefixed); records belonging to other clusters are
    /// untouched.
    ///
    /// Merge rules:
    /// - Observed records overwrite cached status/addresses/tags, keyed by
    ///   instance id. `Terminated` is absorbing and a local `Terminating`
    ///   mark survives a stale platform view that still reports the
    ///   instance live.
    /// - Cached non-terminated records absent from the response transition
    ///   to `Terminated` exactly once (platform-side deletion detected).
    ///   Records admitted after the listing snapshot began, and pending
    ///   records no listing has confirmed yet (within the creation grace),
    ///   are exempt: the snapshot cannot be expected to contain them.
    /// - Terminated records past the grace period are evicted.
    pub async fn refresh(&self, cluster_tag: &str) -> RegistryResult<RefreshOutcome> {
        // Anything admitted after this point post-dates the listing
        // snapshot; its absence from the response means nothing.
        let started = Instant::now();
        let observed = self
            .fleet
            .list_instances(&ListFilter::cluster(cluster_tag))
            .await?;
        let now = epoch_secs();

        let mut outcome = RefreshOutcome {
            observed: observed.len(),
            ..RefreshOutcome::default()
        };

        let mut nodes = self.write();

        let mut seen_instances: HashMap<&str, &InstanceRecord> = HashMap::new();
        for record in &observed {
            seen_instances.insert(record.instance_id.as_str(), record);
        }

        // Overwrite or insert observed records.
        for record in &observed {
            match nodes.get_mut(&record.node_id) {
                Some(entry) if entry.record.instance_id == record.instance_id => {
                    entry.observed = true;
                    let cached = &mut entry.record;
                    if cached.status.is_terminal() {
                        continue;
                    }
                    // Local terminate intent wins over a stale "still
                    // running" view; the node stays hidden from
                    // non-terminated queries until the kill confirms.
                    if cached.status != InstanceStatus::Terminating
                        || record.status.is_terminal()
                    {
                        cached.status = record.status;
                    }
                    cached.internal_address = record.internal_address.clone();
                    cached.external_address = record.external_address.clone();
                    cached.tags = record.tags.clone();
                    if cached.status.is_terminal() && cached.terminated_at.is_none() {
                        cached.terminated_at = Some(now);
                        outcome.terminated.push(cached.node_id.clone());
                    }
                }
                Some(entry) => {
                    // Same node id, different instance id: node ids are
                    // never reassigned, so this is a platform anomaly.
                    warn!(
                        node_id = %record.node_id,
                        cached_instance = %entry.record.instance_id,
                        observed_instance = %record.instance_id,
                        "node id maps to a different instance, keeping cached record"
                    );
                }
                None => {
                    debug!(node_id = %record.node_id, instance_id = %record.instance_id,
                        "discovered instance");
                    nodes.insert(
                        record.node_id.clone(),
                        Entry {
                            record: record.clone(),
                            admitted_at: Instant::now(),
                            observed: true,
                        },
                    );
                }
            }
        }

        // Detect platform-side deletions: cached, in-cluster, non-terminated,
        // absent from the response, and old enough that the snapshot must
        // have known about them.
        for (node_id, entry) in nodes.iter_mut() {
            let cached = &mut entry.record;
            if cached.cluster_name != cluster_tag
                || cached.status.is_terminal()
                || seen_instances.contains_key(cached.instance_id.as_str())
            {
                continue;
            }
            // Admitted while the listing was in flight: the snapshot
            // cannot contain it, so absence is not deletion.
            if entry.admitted_at > started {
                continue;
            }
            // A pending record the eventually-consistent listing has not
            // caught up to yet.
            if !entry.observed
                && cached.status == InstanceStatus::Pending
                && started.duration_since(entry.admitted_at) <= self.creation_grace
            {
                continue;
            }
            cached.status = InstanceStatus::Terminated;
            cached.terminated_at = Some(now);
            info!(%node_id, instance_id = %cached.instance_id,
                "instance gone from platform, marked terminated");
            outcome.terminated.push(node_id.clone());
        }

        // Evict terminated records past the grace period.
        let grace = self.eviction_grace.as_secs();
        let stale: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, e)| {
                e.record.status.is_terminal()
                    && e.record
                        .terminated_at
                        .is_some_and(|t| now.saturating_sub(t) > grace)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in stale {
            nodes.remove(&node_id);
            debug!(%node_id, "evicted terminated record");
            outcome.evicted.push(node_id);
        }

        Ok(outcome)
    }

    /// Cached record for a node. Never blocks on the network.
    pub fn get(&self, node_id: &str) -> Option<InstanceRecord> {
        self.read().get(node_id).map(|e| e.record.clone())
    }

    /// All cached records for a cluster that are neither terminating nor
    /// terminated. Never blocks on the network; possibly stale by up to one
    /// refresh interval.
    pub fn list_non_terminated(&self, cluster_tag: &str) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self
            .read()
            .values()
            .filter(|e| e.record.cluster_name == cluster_tag && e.record.status.is_live())
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Insert or overwrite a record, stamping a fresh admission time. A
    /// cached `Terminated` record is never resurrected; upserts against one
    /// are dropped.
    pub fn upsert(&self, record: InstanceRecord) {
        let mut nodes = self.write();
        if let Some(entry) = nodes.get(&record.node_id)
            && entry.record.status.is_terminal()
            && entry.record.instance_id == record.instance_id
        {
            debug!(node_id = %record.node_id, "upsert ignored, record already terminated");
            return;
        }
        nodes.insert(
            record.node_id.clone(),
            Entry {
                record,
                admitted_at: Instant::now(),
                observed: false,
            },
        );
    }

    /// Mark a node `Terminating` so it disappears from non-terminated
    /// queries before the platform confirms the kill. Returns false if the
    /// node is unknown or already terminal.
    pub fn mark_terminating(&self, node_id: &str) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(node_id) {
            Some(entry) if !entry.record.status.is_terminal() => {
                entry.record.status = InstanceStatus::Terminating;
                true
            }
            _ => false,
        }
    }

    /// Mark a node `Terminated` (absorbing) and start its eviction grace
    /// timer. Returns true only on the first transition.
    pub fn mark_terminated(&self, node_id: &str) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(node_id) {
            Some(entry) if !entry.record.status.is_terminal() => {
                entry.record.status = InstanceStatus::Terminated;
                entry.record.terminated_at = Some(epoch_secs());
                true
            }
            _ => false,
        }
    }

    /// Overwrite mutable tags on a cached record, leaving status untouched.
    pub fn update_tags(&self, node_id: &str, tags: HashMap<String, String>) {
        if let Some(entry) = self.write().get_mut(node_id) {
            entry.record.tags = tags;
        }
    }

    /// Reverse lookup by internal address.
    pub fn find_by_internal_ip(&self, ip: &str) -> Option<NodeId> {
        self.read()
            .values()
            .find(|e| {
                e.record.status.is_live() && e.record.internal_address.as_deref() == Some(ip)
            })
            .map(|e| e.record.node_id.clone())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
