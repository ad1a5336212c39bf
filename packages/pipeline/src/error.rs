use thiserror::Error;

/// Errors raised by the pipeline stores and services.
///
/// Predictable business outcomes (duplicate submissions, rejected state
/// transitions, dropped findings) are returned as structured result types,
/// not through this enum. `PipelineError` covers input precondition
/// failures, policy violations, and external operation failures.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {reason}: {path}")]
    PermissionDenied { path: String, reason: String },

    #[error("external command failed: {0}")]
    CommandFailed(String),

    #[error("external command timed out after {0} seconds")]
    CommandTimeout(u64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
