// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run progress reporting.
//!
//! The orchestrator is the single writer; any number of pollers read the
//! latest snapshot or subscribe to changes. Within one run the reported
//! percentage never decreases; `indeterminate` may appear at any point.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Serialize, Serializer};
use tokio::sync::watch;

use crate::run::{RunError, RunState, RunSummary};

/// Completion estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Percentage, 0 to 100.
    Percent(u8),
    /// Duration unknown (e.g. while the registry is scanned).
    Indeterminate,
}

impl Serialize for Progress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Percent(p) => serializer.serialize_u8(*p),
            Self::Indeterminate => serializer.serialize_str("indeterminate"),
        }
    }
}

/// Latest progress of a run, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Run identifier.
    pub run_id: String,
    /// Run state.
    pub state: RunState,
    /// Completion estimate.
    pub percentage: Progress,
    /// Human-readable status line.
    pub message: String,
    /// Script currently (or last) being executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    /// Whether the run has finished.
    pub done: bool,
    /// Errors so far, in occurrence order.
    pub errors: Vec<RunError>,
    /// Whether any error is critical.
    pub critical: bool,
    /// Non-fatal notes.
    pub warnings: Vec<String>,
}

impl ProgressSnapshot {
    fn starting(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: RunState::Running,
            percentage: Progress::Indeterminate,
            message: "Starting".to_string(),
            script_name: None,
            done: false,
            errors: Vec::new(),
            critical: false,
            warnings: Vec::new(),
        }
    }

    /// Final snapshot of a finished (or interrupted) run.
    pub fn from_summary(summary: &RunSummary) -> Self {
        let done = summary.state.is_terminal();
        Self {
            run_id: summary.run_id.clone(),
            state: summary.state,
            percentage: if done {
                Progress::Percent(100)
            } else {
                Progress::Indeterminate
            },
            message: final_message(summary),
            script_name: summary.outcomes.last().map(|o| o.script_name.clone()),
            done,
            errors: summary.errors.clone(),
            critical: summary.has_critical_error(),
            warnings: summary.warnings.clone(),
        }
    }
}

fn final_message(summary: &RunSummary) -> String {
    let executed = summary.executed_count();
    match summary.state {
        RunState::Completed => format!("Completed: {} script(s) executed", executed),
        RunState::CompletedWithErrors => format!(
            "Completed with {} error(s): {} script(s) executed",
            summary.errors.len(),
            executed
        ),
        RunState::Aborted => match summary.errors.last() {
            Some(error) => format!("Aborted: {}", error.message),
            None => "Aborted".to_string(),
        },
        RunState::Running => "Running".to_string(),
        RunState::Idle => "Idle".to_string(),
    }
}

/// Single-writer, multi-reader progress channel for one run.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<ProgressSnapshot>,
    high_water: AtomicU8,
}

impl ProgressReporter {
    /// Create a reporter for `run_id`, starting indeterminate.
    pub fn new(run_id: &str) -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::starting(run_id));
        Self {
            tx,
            high_water: AtomicU8::new(0),
        }
    }

    /// Publish a progress update. Percentages below an earlier one are raised
    /// to it.
    pub fn update(&self, progress: Progress, message: impl Into<String>, script_name: Option<&str>) {
        let progress = match progress {
            Progress::Percent(p) => {
                let p = p.min(100);
                let previous = self.high_water.fetch_max(p, Ordering::SeqCst);
                Progress::Percent(p.max(previous))
            }
            Progress::Indeterminate => Progress::Indeterminate,
        };
        let message = message.into();

        self.tx.send_modify(|snapshot| {
            snapshot.percentage = progress;
            snapshot.message = message;
            if let Some(name) = script_name {
                snapshot.script_name = Some(name.to_string());
            }
        });
    }

    /// Record an error.
    pub fn push_error(&self, error: RunError) {
        self.tx.send_modify(|snapshot| {
            snapshot.critical |= error.critical;
            snapshot.errors.push(error);
        });
    }

    /// Record a warning.
    pub fn push_warning(&self, warning: impl Into<String>) {
        let warning = warning.into();
        self.tx.send_modify(|snapshot| snapshot.warnings.push(warning));
    }

    /// Publish the final state. Readers see `done == true` from here on.
    pub fn finish(&self, summary: &RunSummary) {
        let mut last = ProgressSnapshot::from_summary(summary);
        if summary.state == RunState::Aborted {
            last.percentage = Progress::Percent(self.high_water.load(Ordering::SeqCst));
        }
        self.tx.send_replace(last);
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribe to updates.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }
}
