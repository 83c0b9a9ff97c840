//! veldaray-provider — the autoscaler-facing node provider.
//!
//! Adapts the reconciler/registry stack to the contract the Ray autoscaler
//! expects: create/terminate requests plus synchronous queries over the
//! cached instance view.
//!
//! ```text
//! autoscaler
//!   └── NodeProvider (this crate)
//!         ├── Reconciler (create/terminate with retries)
//!         └── Registry   (cached reads; refreshed on the autoscaler's poll)
//! ```
//!
//! The provider runs no background loop of its own: the autoscaler's
//! periodic `non_terminated_nodes` poll drives the registry refresh,
//! floor-limited by [`ProviderConfig::refresh_interval`].

pub mod config;
pub mod error;
pub mod provider;

pub use config::ProviderConfig;
pub use error::{ProviderError, ProviderResult};
pub use provider::{NodeProvider, VeldaNodeProvider};
