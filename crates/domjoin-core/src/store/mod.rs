// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable join state.
//!
//! The store keeps one [`JoinRecord`] per script name, the single
//! [`HostJoinStatus`] row, the run lease that serializes orchestrator runs,
//! and the history of run summaries. Every write is flushed before it returns.

pub mod sqlite;

pub use self::sqlite::SqliteStateStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::run::{RunState, RunSummary};
use crate::script::{HostJoinStatus, JoinRecord};

/// Errors from the state store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed (creating the state directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be interpreted.
    #[error("Corrupt record '{key}': {reason}")]
    Corrupt {
        /// Key of the offending row.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Current holder of the run lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    /// Run holding the lease.
    pub run_id: String,
    /// Opaque token of the process that acquired it.
    pub owner: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Result of a compare-and-swap lease acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease.
    Acquired,
    /// Another unexpired lease exists.
    Held(RunLease),
}

/// A persisted run: its summary plus the accumulated script output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    /// Run summary (state, outcomes, errors, warnings).
    pub summary: RunSummary,
    /// Combined output of all scripts in the run.
    pub log: String,
}

/// Durable record of join progress.
///
/// Implementations must make every write durable before returning and must
/// upsert atomically per key, so readers observe either the previous or the
/// new value of a record, never a partial one.
#[async_trait]
pub trait JoinStateStore: Send + Sync {
    /// Record for one script; `None` means never attempted.
    async fn get(&self, script_name: &str) -> Result<Option<JoinRecord>>;

    /// All records, ordered by script name.
    async fn list_records(&self) -> Result<Vec<JoinRecord>>;

    /// Atomic upsert keyed by `script_name`.
    async fn put(&self, record: &JoinRecord) -> Result<()>;

    /// Host join status; the default (not joined) when never set.
    async fn get_host_status(&self) -> Result<HostJoinStatus>;

    /// Replace the host join status.
    async fn set_host_status(&self, status: &HostJoinStatus) -> Result<()>;

    /// Remove every join record and reset the host status (unjoin).
    async fn clear_join_state(&self) -> Result<()>;

    /// Acquire the run lease if it is absent or expired.
    async fn acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration)
    -> Result<LeaseOutcome>;

    /// Extend a lease still held by `run_id`/`owner`. Returns `false` if the
    /// lease was lost.
    async fn renew_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease held by `run_id`/`owner`. Releasing a lease that is
    /// not held is a no-op.
    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()>;

    /// The unexpired lease, if any.
    async fn current_lease(&self) -> Result<Option<RunLease>>;

    /// Upsert a run summary and its log.
    async fn save_run(&self, summary: &RunSummary, log: &str) -> Result<()>;

    /// Load a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>>;

    /// The most recently started run.
    async fn latest_run(&self) -> Result<Option<StoredRun>>;

    /// Runs currently in the given state.
    async fn list_runs_in_state(&self, state: RunState) -> Result<Vec<StoredRun>>;

    /// Delete finished runs outside the `keep` most recently started ones.
    /// Running runs and the latest run are never deleted. Returns the number
    /// of runs removed.
    async fn prune_runs(&self, keep: usize) -> Result<u64>;
}
