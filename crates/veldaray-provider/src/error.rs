//! Provider error types.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors surfaced to the autoscaler.
///
/// Transient fleet conditions never appear here; they are absorbed by the
/// reconciler's retries and only exhausted budgets
/// (`ProvisioningFailed`/`TerminationFailed`) propagate, wrapped in
/// [`ProviderError::Reconcile`].
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Malformed request from the autoscaler (e.g. missing or unknown
    /// node-kind tag, or an attempt to mutate identity tags).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Reconcile(#[from] veldaray_reconciler::ReconcileError),
}
