//! In-memory fleet backend.
//!
//! Stands in for the Velda platform in tests and local simulation. Beyond
//! the `FleetClient` contract it offers:
//!
//! - call counters (`create_calls`, `terminate_calls`) so tests can assert
//!   idempotency properties,
//! - fault injection (`fail_next`) to simulate transient outages,
//! - platform-side mutation helpers (`set_status`, `set_internal_address`,
//!   `remove_instance`) to simulate instances coming up, reporting
//!   addresses, or being deleted out-of-band.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use crate::client::{FleetClient, ListFilter};
use crate::error::{FleetError, FleetResult};
use crate::tags::{TAG_CLUSTER_NAME, TAG_NODE_ID, TAG_NODE_KIND};
use crate::types::{InstanceId, InstanceRecord, InstanceSpec, InstanceStatus};

/// What kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Unavailable,
    NotFound,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<InstanceId, InstanceRecord>,
    /// launch token -> instance id, the platform-side idempotency table.
    tokens: HashMap<String, InstanceId>,
    /// Remaining injected failures, consumed by any mutating call.
    pending_faults: Vec<InjectedFault>,
    create_calls: u64,
    terminate_calls: u64,
    list_calls: u64,
}

/// In-memory `FleetClient` for tests and simulation.
#[derive(Default)]
pub struct FakeFleet {
    state: Mutex<FakeState>,
    next_session: AtomicU64,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `count` injected failures; each subsequent create/terminate
    /// consumes one and fails with the given fault before touching state.
    pub fn fail_next(&self, fault: InjectedFault, count: usize) {
        let mut state = self.lock();
        state.pending_faults.extend(std::iter::repeat_n(fault, count));
    }

    fn take_fault(state: &mut FakeState) -> Option<InjectedFault> {
        if state.pending_faults.is_empty() {
            None
        } else {
            Some(state.pending_faults.remove(0))
        }
    }

    /// Number of `create_instance` calls that reached the platform
    /// (including failed and deduplicated ones).
    pub fn create_calls(&self) -> u64 {
        self.lock().create_calls
    }

    /// Number of `terminate_instance` calls that reached the platform.
    pub fn terminate_calls(&self) -> u64 {
        self.lock().terminate_calls
    }

    pub fn list_calls(&self) -> u64 {
        self.lock().list_calls
    }

    /// Number of distinct instances currently existing.
    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    /// Simulate the platform moving an instance to a new state
    /// (e.g. `Pending` -> `Running` once it boots).
    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Some(record) = self.lock().instances.get_mut(instance_id) {
            record.status = status;
        }
    }

    /// Simulate the platform reporting an internal address.
    pub fn set_internal_address(&self, instance_id: &str, address: &str) {
        if let Some(record) = self.lock().instances.get_mut(instance_id) {
            record.internal_address = Some(address.to_string());
        }
    }

    /// Simulate out-of-band deletion: the instance vanishes from listings.
    pub fn remove_instance(&self, instance_id: &str) {
        self.lock().instances.remove(instance_id);
    }
}

#[async_trait]
impl FleetClient for FakeFleet {
    async fn create_instance(&self, spec: &InstanceSpec) -> FleetResult<InstanceId> {
        let mut state = self.lock();
        state.create_calls += 1;

        spec.validate().map_err(FleetError::InvalidArgument)?;

        if let Some(fault) = Self::take_fault(&mut state) {
            return Err(match fault {
                InjectedFault::Unavailable => {
                    FleetError::Unavailable("injected outage".to_string())
                }
                InjectedFault::NotFound => FleetError::NotFound("injected".to_string()),
            });
        }

        if let Some(existing) = state.tokens.get(&spec.launch_token) {
            return Err(FleetError::DuplicateRequest {
                instance_id: existing.clone(),
            });
        }

        let session_id = format!("sess-{}", self.next_session.fetch_add(1, Ordering::Relaxed));
        let node_id = spec
            .tags
            .get(TAG_NODE_ID)
            .cloned()
            .unwrap_or_else(|| session_id.clone());
        let cluster_tag = spec
            .tags
            .get(TAG_CLUSTER_NAME)
            .cloned()
            .unwrap_or_default();

        let record = InstanceRecord {
            instance_id: session_id.clone(),
            node_id,
            cluster_name: cluster_tag,
            kind: spec.kind,
            status: InstanceStatus::Pending,
            internal_address: None,
            external_address: None,
            tags: spec.tags.clone(),
            created_at: epoch_secs(),
            terminated_at: None,
        };
        state.tokens.insert(spec.launch_token.clone(), session_id.clone());
        state.instances.insert(session_id.clone(), record);
        debug!(instance_id = %session_id, "fake instance created");
        Ok(session_id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> FleetResult<()> {
        let mut state = self.lock();
        state.terminate_calls += 1;

        if let Some(fault) = Self::take_fault(&mut state) {
            return Err(match fault {
                InjectedFault::Unavailable => {
                    FleetError::Unavailable("injected outage".to_string())
                }
                InjectedFault::NotFound => FleetError::NotFound(instance_id.to_string()),
            });
        }

        if state.instances.remove(instance_id).is_none() {
            return Err(FleetError::NotFound(instance_id.to_string()));
        }
        Ok(())
    }

    async fn list_instances(&self, filter: &ListFilter) -> FleetResult<Vec<InstanceRecord>> {
        let mut state = self.lock();
        state.list_calls += 1;

        let mut records: Vec<InstanceRecord> = state
            .instances
            .values()
            .filter(|r| r.tags.contains_key(TAG_NODE_KIND))
            .filter(|r| match &filter.cluster {
                Some(cluster) => r.tags.get(TAG_CLUSTER_NAME) == Some(cluster),
                None => true,
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    async fn get_tags(&self, instance_id: &str) -> FleetResult<HashMap<String, String>> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|r| r.tags.clone())
            .ok_or_else(|| FleetError::NotFound(instance_id.to_string()))
    }

    async fn set_tags(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> FleetResult<()> {
        let mut state = self.lock();
        let record = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::NotFound(instance_id.to_string()))?;
        for (k, v) in tags {
            record.tags.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
