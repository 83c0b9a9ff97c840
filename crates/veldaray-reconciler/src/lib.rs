//! veldaray-reconciler — desired state to confirmed instance operations.
//!
//! The control-loop core: `create_node` and `terminate_node` turn a desired
//! state change into a completed fleet operation, tolerating partial failure
//! of the remote call.
//!
//! ```text
//! Reconciler
//!   ├── FleetClient (create/terminate, wrapped in per-call timeouts)
//!   ├── Registry (optimistic upsert, then authoritative via refresh)
//!   ├── RetryPolicy (bounded exponential backoff, shared by every call)
//!   └── Per-node lock map (create/terminate serialized per node id)
//! ```
//!
//! Transient fleet errors are absorbed here and never reach the provider
//! interface unless the retry budget is exhausted.

pub mod error;
pub mod reconciler;
pub mod retry;

pub use error::{ReconcileError, ReconcileResult};
pub use reconciler::Reconciler;
pub use retry::RetryPolicy;
