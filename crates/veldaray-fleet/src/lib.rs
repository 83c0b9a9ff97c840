//! veldaray-fleet — typed client for the Velda fleet platform.
//!
//! The lowest layer of the node provider: domain types shared by the
//! registry/reconciler/provider crates, the tag & naming scheme, and the
//! `FleetClient` trait with two backends:
//!
//! - [`VeldaFleet`] — shells out to the `vrun` / `velda` CLI, the same
//!   surface the platform exposes to users.
//! - [`FakeFleet`] — in-memory backend with call counters and fault
//!   injection, for tests and local simulation.
//!
//! The client holds no local state and performs no retries of its own;
//! retry/backoff policy lives in `veldaray-reconciler`. Idempotent creation
//! is provided via a caller-supplied launch token carried as an instance tag.

pub mod client;
pub mod error;
pub mod exec;
pub mod fake;
pub mod tags;
pub mod types;
pub mod velda;

pub use client::{FleetClient, ListFilter};
pub use error::{FleetError, FleetResult};
pub use fake::FakeFleet;
pub use types::*;
pub use velda::VeldaFleet;
