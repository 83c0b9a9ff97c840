//! veldaray-registry — in-memory cache of fleet instance state.
//!
//! The registry is the single source of truth for "what do we currently
//! believe exists": a mapping from logical node id to the last-known
//! [`InstanceRecord`](veldaray_fleet::InstanceRecord), refreshed by polling
//! the fleet client and updated incrementally right after local
//! create/terminate calls so reads never wait for the next poll.
//!
//! Reads (`get`, `list_non_terminated`) never touch the network; only
//! `refresh` does, and all network waits happen before the map lock is
//! taken.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{Registry, RefreshOutcome};
