// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run-level types: orchestrator states, per-script outcomes and run summaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::script::RecordStatus;

/// Orchestrator run state.
///
/// ```text
/// Idle ──start()──► Running ──┬──► Completed
///                             ├──► CompletedWithErrors
///                             └──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run has started.
    Idle,
    /// Scripts are being executed.
    Running,
    /// Every due script succeeded or was skipped.
    Completed,
    /// All due scripts were processed, at least one with an error.
    CompletedWithErrors,
    /// The run stopped early (registry unavailable, persistence streak,
    /// cancellation, or interruption).
    Aborted,
}

impl RunState {
    /// Database spelling of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Aborted
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown run state '{}'", other)),
        }
    }
}

/// What kind of invocation started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Full join: domain bind plus every due script.
    Join,
    /// A named subset of scripts.
    Scripts,
}

impl RunKind {
    /// Database spelling of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Scripts => "scripts",
        }
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join" => Ok(Self::Join),
            "scripts" => Ok(Self::Scripts),
            other => Err(format!("unknown run kind '{}'", other)),
        }
    }
}

/// Classification of an error captured during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials missing or rejected.
    Credentials,
    /// The script exited unsuccessfully or could not be started.
    ScriptFailed,
    /// The script exceeded its timeout.
    Timeout,
    /// A state write failed.
    Persistence,
    /// The script registry could not be read.
    Registry,
    /// The run was cancelled between scripts.
    Cancelled,
    /// The process owning the run went away mid-run.
    Interrupted,
}

/// One error entry of a run, as shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// Script the error belongs to, if any.
    pub script_name: Option<String>,
    /// User-facing message. Never contains secret material.
    pub message: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// Critical errors cannot be fixed by retrying the same way.
    pub critical: bool,
}

impl RunError {
    /// Create an error entry; `critical` follows from the kind.
    pub fn new(script_name: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            script_name: script_name.map(str::to_string),
            message: message.into(),
            kind,
            critical: kind == ErrorKind::Credentials,
        }
    }

    /// Error attached to a script.
    pub fn for_script(script_name: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(Some(script_name), kind, message)
    }

    /// Run-level error with no script.
    pub fn run_level(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(None, kind, message)
    }
}

/// Outcome of one script within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcome {
    /// Script name.
    pub script_name: String,
    /// Result as observed by the run.
    pub status: RecordStatus,
    /// Short result message.
    pub message: String,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Error classification when the script failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ScriptOutcome {
    /// The run error this outcome contributes, if it failed.
    pub fn to_error(&self) -> Option<RunError> {
        if self.status != RecordStatus::Failed {
            return None;
        }
        let kind = self.error_kind.unwrap_or(ErrorKind::ScriptFailed);
        Some(RunError::for_script(&self.script_name, kind, &self.message))
    }
}

/// Aggregate result of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// What started the run.
    pub kind: RunKind,
    /// Current or final state.
    pub state: RunState,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-script outcomes in execution order.
    pub outcomes: Vec<ScriptOutcome>,
    /// Errors in occurrence order.
    pub errors: Vec<RunError>,
    /// Non-fatal notes (requested scripts that were not due).
    pub warnings: Vec<String>,
    /// Host join status after the run.
    pub joined: bool,
}

impl RunSummary {
    /// Fresh summary for a run that is starting.
    pub fn new(run_id: impl Into<String>, kind: RunKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            joined: false,
        }
    }

    /// Number of scripts that actually ran (succeeded or failed, not skipped).
    pub fn executed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status != RecordStatus::Skipped)
            .count()
    }

    /// Whether any error is critical.
    pub fn has_critical_error(&self) -> bool {
        self.errors.iter().any(|e| e.critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_credential_errors_are_critical() {
        assert!(RunError::for_script("bind", ErrorKind::Credentials, "rejected").critical);
        assert!(!RunError::for_script("bind", ErrorKind::ScriptFailed, "exit 1").critical);
        assert!(!RunError::for_script("bind", ErrorKind::Timeout, "timed out").critical);
        assert!(!RunError::run_level(ErrorKind::Registry, "unreadable").critical);
    }

    #[test]
    fn test_outcome_to_error() {
        let failed = ScriptOutcome {
            script_name: "bind".to_string(),
            status: RecordStatus::Failed,
            message: "timed out after 5s".to_string(),
            duration_ms: 5000,
            error_kind: Some(ErrorKind::Timeout),
        };
        let error = failed.to_error().unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.script_name.as_deref(), Some("bind"));

        let ok = ScriptOutcome {
            status: RecordStatus::Configured,
            error_kind: None,
            ..failed
        };
        assert!(ok.to_error().is_none());
    }

    #[test]
    fn test_run_state_terminal_and_parse() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::CompletedWithErrors.is_terminal());
        assert_eq!(
            "completed_with_errors".parse::<RunState>().unwrap(),
            RunState::CompletedWithErrors
        );
    }

    #[test]
    fn test_run_error_serializes_camel_case() {
        let error = RunError::for_script("bind", ErrorKind::Credentials, "rejected");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["scriptName"], "bind");
        assert_eq!(json["kind"], "credentials");
        assert_eq!(json["critical"], true);
    }
}
