//! Create/terminate orchestration with per-node serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use veldaray_fleet::tags::{cluster_tag_value, creation_tags, generate_node_id, launch_token_for};
use veldaray_fleet::{
    FleetClient, FleetError, FleetResult, InstanceRecord, InstanceSpec, InstanceStatus, NodeId,
    NodeKind,
};
use veldaray_registry::Registry;

use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;

/// Turns desired-state changes into completed, confirmed instance
/// lifecycle operations.
///
/// Operations on a single node id are linearized through a per-node lock:
/// a terminate issued while that node's create is still in flight waits for
/// the create to complete or definitively fail. Unrelated nodes proceed in
/// parallel.
pub struct Reconciler {
    fleet: Arc<dyn FleetClient>,
    registry: Arc<Registry>,
    retry: RetryPolicy,
    /// Deadline for each individual fleet call; exceeding it counts as
    /// `Unavailable` for retry purposes.
    call_timeout: Duration,
    /// Velda pool new instances are allocated from.
    pool: String,
    /// Prefix for generated node ids.
    node_prefix: String,
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(fleet: Arc<dyn FleetClient>, registry: Arc<Registry>) -> Self {
        Self {
            fleet,
            registry,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            pool: "shell".to_string(),
            node_prefix: "ray-worker".to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the retry policy applied around every fleet call.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call fleet timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the Velda pool for new instances.
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Set the prefix for generated node ids.
    pub fn with_node_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.node_prefix = prefix.into();
        self
    }

    /// Create a node of the given kind for a cluster. Returns the new
    /// logical node id once the platform has acknowledged the instance.
    ///
    /// Retries `Unavailable` responses with backoff, reusing the same
    /// launch token so at most one instance is created. On success the
    /// registry immediately holds a `Pending` record; on exhausted budget
    /// it holds nothing and the caller retries with a fresh id.
    pub async fn create_node(
        &self,
        cluster_name: &str,
        kind: NodeKind,
        extra_tags: &HashMap<String, String>,
    ) -> ReconcileResult<NodeId> {
        let node_id = generate_node_id(&self.node_prefix);
        self.create_node_with_id(&node_id, cluster_name, kind, extra_tags)
            .await?;
        Ok(node_id)
    }

    /// Like [`create_node`](Self::create_node) with a caller-chosen node id.
    /// The id must not be in use; ids are never reused across instances.
    pub async fn create_node_with_id(
        &self,
        node_id: &str,
        cluster_name: &str,
        kind: NodeKind,
        extra_tags: &HashMap<String, String>,
    ) -> ReconcileResult<()> {
        let lock = self.node_lock(node_id);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(node_id, cluster_name, kind, extra_tags).await
        };
        self.drop_node_lock(node_id, lock);
        result
    }

    async fn create_locked(
        &self,
        node_id: &str,
        cluster_name: &str,
        kind: NodeKind,
        extra_tags: &HashMap<String, String>,
    ) -> ReconcileResult<()> {
        let launch_token = launch_token_for(node_id);
        let mut tags = extra_tags.clone();
        // Identity tags win over whatever the caller supplied.
        tags.extend(creation_tags(cluster_name, kind, node_id, &launch_token));

        let spec = InstanceSpec {
            cluster_name: cluster_name.to_string(),
            kind,
            pool: self.pool.clone(),
            tags,
            launch_token,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            let result = self.bounded(self.fleet.create_instance(&spec)).await;
            match result {
                Ok(instance_id) => {
                    self.registry.upsert(pending_record(&spec, node_id, &instance_id));
                    info!(%node_id, %instance_id, cluster = %cluster_name,
                        kind = kind.as_str(), "node created");
                    return Ok(());
                }
                // The launch token already produced an instance on an
                // earlier attempt whose reply we lost.
                Err(FleetError::DuplicateRequest { instance_id }) => {
                    self.registry.upsert(pending_record(&spec, node_id, &instance_id));
                    info!(%node_id, %instance_id, "node create resolved to existing instance");
                    return Ok(());
                }
                Err(FleetError::InvalidArgument(msg)) => {
                    return Err(ReconcileError::InvalidSpec(msg));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(%node_id, attempt, error = %e, ?delay, "create failed, retrying");
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        Err(ReconcileError::ProvisioningFailed {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    /// Terminate a node. Idempotent: an unknown or already-terminated node
    /// is a successful no-op with no platform call.
    pub async fn terminate_node(&self, node_id: &str) -> ReconcileResult<()> {
        let lock = self.node_lock(node_id);
        let result = {
            let _guard = lock.lock().await;
            self.terminate_locked(node_id).await
        };
        self.drop_node_lock(node_id, lock);
        result
    }

    async fn terminate_locked(&self, node_id: &str) -> ReconcileResult<()> {
        let record = match self.registry.get(node_id) {
            Some(r) if !r.status.is_terminal() => r,
            Some(_) => {
                debug!(%node_id, "terminate: node already terminated");
                return Ok(());
            }
            None => {
                debug!(%node_id, "terminate: node unknown, nothing to do");
                return Ok(());
            }
        };

        // Hide the node from non-terminated queries before the platform
        // confirms the kill.
        self.registry.mark_terminating(node_id);

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            let result = self.bounded(self.fleet.terminate_instance(&record.instance_id)).await;
            match result {
                Ok(()) => {
                    self.registry.mark_terminated(node_id);
                    info!(%node_id, instance_id = %record.instance_id, "node terminated");
                    return Ok(());
                }
                // Already gone on the platform side: same outcome.
                Err(FleetError::NotFound(_)) => {
                    self.registry.mark_terminated(node_id);
                    debug!(%node_id, "terminate: instance already gone");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(%node_id, attempt, error = %e, ?delay, "terminate failed, retrying");
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        // The node stays `Terminating`; a later terminate retry or a
        // refresh observing the deletion finishes the transition.
        Err(ReconcileError::TerminationFailed {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    /// Apply tags to an instance, retrying transient failures under the
    /// same policy as lifecycle operations.
    pub async fn set_tags(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> ReconcileResult<()> {
        let mut last_error: Option<FleetError> = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.bounded(self.fleet.set_tags(instance_id, tags)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(%instance_id, attempt, error = %e, ?delay, "set-tags failed, retrying");
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_error
            .map(ReconcileError::Fleet)
            .unwrap_or_else(|| {
                ReconcileError::Fleet(FleetError::Unavailable("retry budget exhausted".to_string()))
            }))
    }

    /// Wrap a fleet call in the per-call deadline; a timeout counts as
    /// `Unavailable` so the retry loop treats it like any outage.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = FleetResult<T>>,
    ) -> FleetResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Unavailable("fleet call timed out".to_string())),
        }
    }

    fn node_lock(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Remove a node's lock entry once nothing else holds or awaits it,
    /// so the map does not grow one entry per node id forever under churn.
    /// `node_lock` clones under the same map mutex, so the reference count
    /// cannot change between the check and the removal.
    fn drop_node_lock(&self, node_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Two references left: the map's and ours.
        if Arc::strong_count(&lock) == 2
            && locks.get(node_id).is_some_and(|entry| Arc::ptr_eq(entry, &lock))
        {
            locks.remove(node_id);
        }
    }

    #[cfg(test)]
    fn node_lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn pending_record(spec: &InstanceSpec, node_id: &str, instance_id: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        node_id: node_id.to_string(),
        cluster_name: cluster_tag_value(&spec.cluster_name),
        kind: spec.kind,
        status: InstanceStatus::Pending,
        internal_address: None,
        external_address: None,
        tags: spec.tags.clone(),
        created_at: epoch_secs(),
        terminated_at: None,
    }
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
    use veldaray_fleet::fake::InjectedFault;
    use veldaray_fleet::FakeFleet;

    fn setup() -> (Arc<FakeFleet>, Arc<Registry>, Reconciler) {
        let fleet = Arc::new(FakeFleet::new());
        let registry = Arc::new(Registry::new(fleet.clone()));
        let reconciler = Reconciler::new(fleet.clone(), registry.clone())
            .with_retry(RetryPolicy::fast(3));
        (fleet, registry, reconciler)
    }

    #[tokio::test]
    async fn create_node_leaves_pending_record() {
        let (fleet, registry, reconciler) = setup();

        let node_id = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();

        let record = registry.get(&node_id).unwrap();
        assert_eq!(record.status, InstanceStatus::Pending);
        assert_eq!(record.cluster_name, "ray-demo");
        assert_eq!(record.kind, NodeKind::Worker);
        assert_eq!(fleet.create_calls(), 1);
    }

    #[tokio::test]
    async fn create_merges_autoscaler_tags_without_losing_identity() {
        let (_, registry, reconciler) = setup();

        let mut extra = HashMap::new();
        extra.insert("ray-node-status".to_string(), "uninitialized".to_string());
        extra.insert(
            veldaray_fleet::tags::TAG_NODE_ID.to_string(),
            "spoofed".to_string(),
        );

        let node_id = reconciler
            .create_node("demo", NodeKind::Head, &extra)
            .await
            .unwrap();

        let record = registry.get(&node_id).unwrap();
        assert_eq!(record.tags.get("ray-node-status").unwrap(), "uninitialized");
        // Identity tags cannot be overridden by caller-supplied tags.
        assert_eq!(
            record.tags.get(veldaray_fleet::tags::TAG_NODE_ID).unwrap(),
            &node_id
        );
    }

    #[tokio::test]
    async fn create_retries_transient_failures_with_one_instance() {
        let (fleet, _, reconciler) = setup();
        fleet.fail_next(InjectedFault::Unavailable, 2);

        reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(fleet.create_calls(), 3);
        assert_eq!(fleet.instance_count(), 1);
    }

    #[tokio::test]
    async fn create_exhausting_budget_leaves_no_registry_entry() {
        let (fleet, registry, reconciler) = setup();
        fleet.fail_next(InjectedFault::Unavailable, 3);

        let err = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::ProvisioningFailed { attempts: 3, .. }
        ));
        assert_eq!(fleet.instance_count(), 0);
        assert!(registry.list_non_terminated("ray-demo").is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_fails_fast_without_retry() {
        let (fleet, _, reconciler) = setup();
        let reconciler = reconciler.with_pool("");

        let err = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::InvalidSpec(_)));
        assert_eq!(fleet.create_calls(), 1);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_with_single_platform_call() {
        let (fleet, registry, reconciler) = setup();
        let node_id = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();

        reconciler.terminate_node(&node_id).await.unwrap();
        reconciler.terminate_node(&node_id).await.unwrap();

        assert_eq!(fleet.terminate_calls(), 1);
        assert_eq!(
            registry.get(&node_id).unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[tokio::test]
    async fn terminate_unknown_node_is_a_no_op() {
        let (fleet, _, reconciler) = setup();
        reconciler.terminate_node("never-existed").await.unwrap();
        assert_eq!(fleet.terminate_calls(), 0);
    }

    #[tokio::test]
    async fn terminate_treats_not_found_as_success() {
        let (fleet, registry, reconciler) = setup();
        let node_id = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();
        let instance_id = registry.get(&node_id).unwrap().instance_id;

        // Deleted out-of-band before we terminate.
        fleet.remove_instance(&instance_id);

        reconciler.terminate_node(&node_id).await.unwrap();
        assert_eq!(
            registry.get(&node_id).unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[tokio::test]
    async fn terminate_retries_transient_failures() {
        let (fleet, registry, reconciler) = setup();
        let node_id = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();

        fleet.fail_next(InjectedFault::Unavailable, 2);
        reconciler.terminate_node(&node_id).await.unwrap();

        assert_eq!(fleet.terminate_calls(), 3);
        assert_eq!(
            registry.get(&node_id).unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[tokio::test]
    async fn terminate_budget_exhaustion_leaves_node_terminating() {
        let (fleet, registry, reconciler) = setup();
        let node_id = reconciler
            .create_node("demo", NodeKind::Worker, &HashMap::new())
            .await
            .unwrap();

        fleet.fail_next(InjectedFault::Unavailable, 3);
        let err = reconciler.terminate_node(&node_id).await.unwrap_err();

        assert!(matches!(err, ReconcileError::TerminationFailed { .. }));
        // Hidden from live queries even though the kill never confirmed.
        assert_eq!(
            registry.get(&node_id).unwrap().status,
            InstanceStatus::Terminating
        );
        assert!(registry.list_non_terminated("ray-demo").is_empty());
    }

    #[tokio::test]
    async fn node_locks_do_not_accumulate_across_churn() {
        let (_, _, reconciler) = setup();

        for _ in 0..3 {
            let node_id = reconciler
                .create_node("demo", NodeKind::Worker, &HashMap::new())
                .await
                .unwrap();
            reconciler.terminate_node(&node_id).await.unwrap();
        }
        reconciler.terminate_node("never-existed").await.unwrap();

        assert_eq!(reconciler.node_lock_count(), 0);
    }

    #[tokio::test]
    async fn terminate_waits_for_in_flight_create() {
        let (fleet, registry, reconciler) = setup();
        let reconciler = Arc::new(reconciler.with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        }));

        // The create will fail twice and back off, so it is in flight for
        // ~100ms while holding the node lock.
        fleet.fail_next(InjectedFault::Unavailable, 2);

        let create_reconciler = reconciler.clone();
        let create = tokio::spawn(async move {
            create_reconciler
                .create_node_with_id("w-1", "demo", NodeKind::Worker, &HashMap::new())
                .await
        });

        // Give the create task time to take the lock and start retrying.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The terminate must wait for the create to resolve, observe the
        // pending record, and tear it down.
        reconciler.terminate_node("w-1").await.unwrap();

        create.await.unwrap().unwrap();
        assert_eq!(
            registry.get("w-1").unwrap().status,
            InstanceStatus::Terminated
        );
        assert_eq!(fleet.instance_count(), 0);
        assert_eq!(fleet.terminate_calls(), 1);
        // The contended lock entry is reclaimed once both operations end.
        assert_eq!(reconciler.node_lock_count(), 0);
    }
}
