//! Registry error types.

use thiserror::Error;
use veldaray_fleet::FleetError;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
///
/// Only `refresh` talks to the platform, so this is mostly a passthrough;
/// cache reads and writes are infallible.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("fleet error during refresh: {0}")]
    Fleet(#[from] FleetError),
}
