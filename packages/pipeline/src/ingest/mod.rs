//! Changelist ingestion: fetch the change, admit it through dispatch,
//! enqueue the review work.

mod fetcher;
mod service;

pub use fetcher::{
    ChangeFetcher, CommandOutput, CommandRunner, FetchedChange, ProcessCommandRunner,
    SecurityEvent, DEFAULT_COMMAND_TIMEOUT_SECONDS,
};
pub use service::{ChangeIngestService, IngestResult, IngestStatus};
