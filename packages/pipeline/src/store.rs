//! SQLite-backed coordination store.
//!
//! Every subsystem shares one pool. All timestamps are stamped in SQL with
//! `CURRENT_TIMESTAMP` (UTC, one-second resolution) so relative orderings
//! stay observable from tests, and lease arithmetic happens database-side
//! with `datetime('now', ...)`.

use std::path::Path;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// How long a writer waits on the SQLite lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the store at `path`, creating the file and schema if missing.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;
    debug!(path = %path.as_ref().display(), "store opened");
    Ok(pool)
}

/// Open an isolated in-memory store.
///
/// The pool is pinned to a single connection: every handle must see the
/// same in-memory database, and a lone writer matches the file-backed
/// locking behavior.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// The store clock, as SQL sees it: `YYYY-MM-DD HH:MM:SS` in UTC.
pub async fn now(pool: &SqlitePool) -> Result<String> {
    let now: String = sqlx::query_scalar("SELECT CURRENT_TIMESTAMP")
        .fetch_one(pool)
        .await?;
    Ok(now)
}
