// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for join script runners.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use thiserror::Error;

use crate::script::{JoinScript, RecordStatus};

/// Errors from runner operations.
///
/// A script that runs and fails is not an error; it yields a
/// [`ScriptResult`] with status `Failed`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The script could not be started.
    #[error("failed to start {script}: {source}")]
    Spawn {
        /// Script name.
        script: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O operation failed while supervising the script.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for executing one script.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run the script belongs to.
    pub run_id: String,
    /// Environment variables passed to the script.
    pub env: HashMap<String, String>,
    /// Hard wall-clock timeout.
    pub timeout: Duration,
}

/// Structured outcome of one script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResult {
    /// Configured, Failed, or Skipped.
    pub status: RecordStatus,
    /// Short result message.
    pub message: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Exit code, if the script exited normally.
    pub exit_code: Option<i32>,
    /// Whether the script was killed for exceeding its timeout.
    pub timed_out: bool,
    /// Combined stdout and stderr, bounded.
    pub output: String,
    /// Whether `output` was cut at the bound.
    pub truncated: bool,
}

impl ScriptResult {
    /// Result for a script killed at its timeout.
    pub fn timed_out(timeout: Duration, duration_ms: u64, output: String, truncated: bool) -> Self {
        Self {
            status: RecordStatus::Failed,
            message: format!("timed out after {}s", timeout.as_secs()),
            duration_ms,
            exit_code: None,
            timed_out: true,
            output,
            truncated,
        }
    }
}

/// Cancellation token checked by the orchestrator between scripts.
pub type CancelToken = Arc<AtomicBool>;

/// Trait for join script runners.
///
/// Runners are PURE execution engines: they do NOT touch the join state
/// store. Recording outcomes is handled by the caller.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock").
    fn runner_type(&self) -> &'static str;

    /// Execute `script`, waiting for completion or timeout.
    ///
    /// On timeout the script and everything it spawned are terminated
    /// before this returns.
    async fn execute(&self, script: &JoinScript, options: &LaunchOptions) -> Result<ScriptResult>;
}
