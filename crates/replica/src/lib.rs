//! Contracts for the replication layer as seen by the transaction manager.
//!
//! The manager never talks to replicas directly; it resolves primaries
//! through a [`PlacementDriver`] and sends typed requests through a
//! [`ReplicaService`]. In-memory implementations of both live in [`mock`]
//! and back the test suites.

mod error;
mod messages;
mod placement;
mod service;

pub mod mock;

pub use error::{PlacementError, ReplicaError};
pub use messages::{ReplicaRequest, ReplicaResponse, TxCleanupRequest, TxFinishRequest};
pub use placement::{PlacementDriver, ReplicaMeta};
pub use service::ReplicaService;
