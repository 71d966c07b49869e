//! Shared transaction vocabulary: identifiers, state machine, timestamp
//! tracking and one-shot completion signalling.

mod completion;
mod partition;
mod state;
mod tracker;
mod transaction_id;

pub use completion::Completion;
pub use partition::{LeaseToken, PartitionId};
pub use state::{FinishWatch, TxState, TxStateMeta};
pub use tracker::TimestampTracker;
pub use transaction_id::{TransactionId, TransactionIdGenerator};
