//! Asynchronous memory writeback.
//!
//! Every recorded turn gets one row in `pending_memory_writes` ([`queue`]).
//! Workers ([`worker`]) claim rows, embed the content, and turn them into
//! long-term memories. A turn yields exactly one successful outcome: the
//! claim token guards the delete, and the memories table refuses a second
//! memory for the same source turn.

pub mod queue;
pub mod worker;

pub use queue::{PendingStatus, PendingWrite, QueueCounts, RetryPolicy};
pub use worker::{Outcome, Worker, WorkerSettings, WritebackPool};
