// Changelist Review Pipeline - Core
//
// Durable coordination state for automated changelist review: a leased work
// queue with sweeper and worker runtime, a deduplicating job dispatch gate,
// an at-most-once notification outbox, and a dead-letter replay workflow,
// all backed by a single SQLite store so every state transition is durable
// and recoverable across crashes.

pub mod dispatch;
pub mod error;
pub mod failure;
pub mod ingest;
pub mod outbox;
pub mod queue;
pub mod review;
pub mod store;

pub use error::{PipelineError, Result};
