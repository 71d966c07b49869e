//! Distributed transaction coordination.
//!
//! The [`TxManager`] opens read-write and read-only transactions, tracks
//! their state across the cluster, records which partitions each
//! transaction touches, and drives a two-phase commit/rollback protocol
//! against replicated partition groups under the leaseholder model. It also
//! maintains the low watermark bounding the history that read-only
//! transactions may still observe.

mod config;
mod context;
mod error;
mod gate;
mod manager;
mod transaction;

pub use config::TxManagerConfig;
pub use error::{Result, TxnError};
pub use manager::TxManager;
pub use transaction::{ReadOnlyTransaction, ReadWriteTransaction, Transaction};
