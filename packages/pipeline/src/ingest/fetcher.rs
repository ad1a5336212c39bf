//! Perforce changelist fetching with allow-list enforcement.
//!
//! Invocation is argumentized, never interpolated through a shell, and
//! bounded by a timeout. Every depot path (caller-requested or fetched)
//! is checked against the allow-list; rejections are appended to an audit
//! log before they surface as permission errors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::warn;

use crate::error::{PipelineError, Result};

lazy_static! {
    static ref DEPOT_PATH_RE: Regex = Regex::new(r"^//\S+").unwrap();
    static ref DEPOT_FILE_LINE_RE: Regex = Regex::new(r"(?m)^\.\.\. depotFile (//\S+)$").unwrap();
}

/// Default bound on one source-control invocation.
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 15;

/// Output of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub returncode: i32,
    pub stdout: String,
}

/// Capability surface for running the source-control tool.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as real subprocesses.
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, cmd: &[String], timeout: Duration) -> Result<CommandOutput> {
        let (program, args) = cmd.split_first().ok_or_else(|| {
            PipelineError::InvalidInput("command must not be empty".to_string())
        })?;

        let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| PipelineError::CommandTimeout(timeout.as_secs()))?
            .map_err(|err| PipelineError::CommandFailed(err.to_string()))?;

        Ok(CommandOutput {
            returncode: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Audit record for a rejected depot path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    pub path: String,
    pub reason: String,
}

/// A changelist and the depot files it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChange {
    pub changelist_id: i64,
    pub files: Vec<String>,
}

/// Fetches changelist files through `p4 -ztag describe -s`, restricted to
/// an allow-list of depot prefixes.
pub struct ChangeFetcher {
    allowlist_prefixes: Vec<String>,
    p4_binary: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    security_events: Mutex<Vec<SecurityEvent>>,
}

impl ChangeFetcher {
    /// Validate the allow-list and build a fetcher over `runner`.
    ///
    /// Entries must start with `//`, must not be empty after stripping
    /// trailing slashes, and may carry `...` only as a trailing wildcard.
    pub fn new(allowlist_prefixes: &[String], runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Ok(Self {
            allowlist_prefixes: Self::validate_allowlist(allowlist_prefixes)?,
            p4_binary: "p4".to_string(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
            runner,
            security_events: Mutex::new(Vec::new()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_p4_binary(mut self, binary: impl Into<String>) -> Self {
        self.p4_binary = binary.into();
        self
    }

    /// Describe `changelist_id` and return its depot files.
    ///
    /// `requested_paths` are validated before the subprocess runs; fetched
    /// paths are validated after. Either kind of violation is audited and
    /// raised as a permission error.
    pub async fn fetch_change(
        &self,
        changelist_id: i64,
        requested_paths: &[String],
    ) -> Result<FetchedChange> {
        for path in requested_paths {
            let normalized = Self::normalize_depot_path(path)?;
            if !self.is_allowed(&normalized) {
                self.record_security_event(&normalized, "requested_path_not_allowed");
                return Err(PipelineError::PermissionDenied {
                    path: normalized,
                    reason: "requested_path_not_allowed".to_string(),
                });
            }
        }

        let cmd = vec![
            self.p4_binary.clone(),
            "-ztag".to_string(),
            "describe".to_string(),
            "-s".to_string(),
            changelist_id.to_string(),
        ];
        let completed = self.runner.run(&cmd, self.timeout).await?;
        if completed.returncode != 0 {
            return Err(PipelineError::CommandFailed(format!(
                "p4 describe failed with code {}",
                completed.returncode
            )));
        }

        let mut files = Vec::new();
        for caps in DEPOT_FILE_LINE_RE.captures_iter(&completed.stdout) {
            files.push(Self::normalize_depot_path(&caps[1])?);
        }
        for path in &files {
            if !self.is_allowed(path) {
                self.record_security_event(path, "fetched_path_not_allowed");
                return Err(PipelineError::PermissionDenied {
                    path: path.clone(),
                    reason: "fetched_path_not_allowed".to_string(),
                });
            }
        }

        Ok(FetchedChange {
            changelist_id,
            files,
        })
    }

    /// Audit log of rejected paths, oldest first.
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.security_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn validate_allowlist(prefixes: &[String]) -> Result<Vec<String>> {
        let mut validated = Vec::new();
        for raw in prefixes {
            let normalized = raw.trim().trim_end_matches('/').to_string();
            if normalized.is_empty() {
                return Err(PipelineError::InvalidInput(
                    "allowlist entries must be non-empty".to_string(),
                ));
            }
            if !normalized.starts_with("//") {
                return Err(PipelineError::InvalidInput(
                    "allowlist entries must start with //".to_string(),
                ));
            }
            if normalized.contains("...") && !normalized.ends_with("...") {
                return Err(PipelineError::InvalidInput(
                    "allowlist wildcard is only allowed as trailing ...".to_string(),
                ));
            }
            validated.push(normalized);
        }

        if validated.is_empty() {
            return Err(PipelineError::InvalidInput(
                "allowlist_prefixes must not be empty".to_string(),
            ));
        }
        Ok(validated)
    }

    fn normalize_depot_path(path: &str) -> Result<String> {
        let normalized = path.trim().to_string();
        if !DEPOT_PATH_RE.is_match(&normalized) {
            return Err(PipelineError::InvalidInput(format!(
                "invalid depot path: {path}"
            )));
        }
        Ok(normalized)
    }

    fn is_allowed(&self, depot_path: &str) -> bool {
        self.allowlist_prefixes.iter().any(|prefix| {
            if let Some(stem) = prefix.strip_suffix("...") {
                depot_path.starts_with(stem)
            } else {
                depot_path == prefix || depot_path.starts_with(&format!("{prefix}/"))
            }
        })
    }

    fn record_security_event(&self, path: &str, reason: &str) {
        warn!(path, reason, "depot path rejected by allowlist");
        if let Ok(mut events) = self.security_events.lock() {
            events.push(SecurityEvent {
                path: path.to_string(),
                reason: reason.to_string(),
            });
        }
    }
}
