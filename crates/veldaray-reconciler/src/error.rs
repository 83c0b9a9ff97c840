//! Reconciler error types.

use thiserror::Error;
use veldaray_fleet::FleetError;

/// Result type alias for reconciler operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors surfaced to the node provider interface.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Retry budget exhausted while creating an instance. The registry
    /// holds no entry for the node; the caller retries with a fresh id.
    #[error("provisioning failed after {attempts} attempts: {last_error}")]
    ProvisioningFailed { attempts: u32, last_error: String },

    /// Retry budget exhausted while terminating. The node stays
    /// `Terminating` (hidden from non-terminated queries) until a later
    /// retry or refresh resolves it.
    #[error("termination failed after {attempts} attempts: {last_error}")]
    TerminationFailed { attempts: u32, last_error: String },

    /// Caller/config defect, failed fast without retry.
    #[error("invalid node spec: {0}")]
    InvalidSpec(String),

    #[error("registry error: {0}")]
    Registry(#[from] veldaray_registry::RegistryError),

    #[error("fleet error: {0}")]
    Fleet(#[from] FleetError),
}
