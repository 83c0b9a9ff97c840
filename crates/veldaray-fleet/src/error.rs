//! Error taxonomy for fleet operations.

use thiserror::Error;

/// Result type alias for fleet client operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by fleet client operations.
///
/// The taxonomy drives the reconciler's retry decisions: only
/// [`FleetError::Unavailable`] is safe to retry with the same arguments.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Transport/network failure or timeout. Safe to retry.
    #[error("fleet unavailable: {0}")]
    Unavailable(String),

    /// The instance no longer exists on the platform.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Malformed spec or arguments. Caller/config defect, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A create with the same launch token already produced an instance.
    /// Resolved by using the existing instance rather than erroring.
    #[error("duplicate request, existing instance {instance_id}")]
    DuplicateRequest { instance_id: String },

    /// The platform returned output we could not parse.
    #[error("malformed fleet response: {0}")]
    Malformed(String),
}

impl FleetError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Unavailable(_))
    }
}
