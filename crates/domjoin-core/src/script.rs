// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Join script, join record and host status types.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunError;

/// How safely a join script may be executed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdempotencyClass {
    /// Re-execution is always safe and cheap; due on every run.
    SafeRerun,
    /// Executes at most once unless forced.
    RunOnce,
    /// Never executed unless the caller forces it.
    RequiresForce,
}

impl IdempotencyClass {
    /// Header/database spelling of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SafeRerun => "safe-rerun",
            Self::RunOnce => "run-once",
            Self::RequiresForce => "requires-force",
        }
    }
}

impl fmt::Display for IdempotencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "safe-rerun" | "saferun" | "safererun" => Ok(Self::SafeRerun),
            "run-once" | "runonce" => Ok(Self::RunOnce),
            "requires-force" | "requiresforce" => Ok(Self::RequiresForce),
            other => Err(format!("unknown idempotency class '{}'", other)),
        }
    }
}

/// One idempotent configuration step shipped by an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinScript {
    /// Unique script name.
    pub name: String,
    /// Executable on disk.
    pub path: PathBuf,
    /// Host roles the script applies to. Empty means every role.
    pub applicable_roles: BTreeSet<String>,
    /// Execution order; lower runs first.
    pub weight: i32,
    /// Re-execution policy.
    pub idempotency_class: IdempotencyClass,
    /// Declared script version. A newer version than the recorded one makes
    /// a configured script due again.
    pub version: u32,
    /// Whether this script performs (part of) the domain bind.
    pub domain_bind: bool,
    /// Optional human-readable description.
    pub description: Option<String>,
}

impl JoinScript {
    /// Whether the script applies to a host with the given role.
    pub fn applies_to(&self, host_role: &str) -> bool {
        self.applicable_roles.is_empty()
            || self.applicable_roles.contains("*")
            || self.applicable_roles.contains(host_role)
    }

    /// Whether executing this script needs the caller's credentials.
    ///
    /// `RunOnce` and domain-bind scripts touch the domain; `SafeRerun`
    /// local-only scripts do not.
    pub fn requires_credentials(&self) -> bool {
        self.domain_bind || self.idempotency_class == IdempotencyClass::RunOnce
    }
}

/// Persisted outcome status of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// The script completed successfully.
    Configured,
    /// The script failed (non-success exit, timeout, credentials, ...).
    Failed,
    /// The script reported it had nothing to do.
    Skipped,
}

impl RecordStatus {
    /// Database spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configured" => Ok(Self::Configured),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// Persisted outcome of the latest execution of one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRecord {
    /// Script this record belongs to.
    pub script_name: String,
    /// Outcome of the last execution.
    pub status: RecordStatus,
    /// Script version that produced this record.
    pub version: u32,
    /// When the last execution finished.
    pub last_run_at: DateTime<Utc>,
    /// Message from the last execution (never contains secrets).
    pub last_result_message: String,
    /// Number of executions so far.
    pub attempts: u32,
}

/// Aggregate join state of this host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostJoinStatus {
    /// Whether the host is a member of the domain.
    pub joined: bool,
    /// When the host became joined.
    pub joined_at: Option<DateTime<Utc>>,
    /// Domain controller used for the bind.
    pub domain_controller_host: String,
    /// Errors of the most recent full join run, in occurrence order.
    pub last_full_run_errors: Vec<RunError>,
}
