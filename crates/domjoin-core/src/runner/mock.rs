// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! A simple runner implementation that simulates join script execution
//! without actually spawning processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;
use crate::script::{JoinScript, RecordStatus};

/// Simulated outcome of one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Exit successfully.
    Succeed,
    /// Exit with a failure message.
    Fail(String),
    /// Report "already satisfied".
    Skip,
    /// Never finish; the runner reports a timeout after `options.timeout`.
    Hang,
    /// Fail to start at all.
    SpawnError,
}

/// One recorded execution.
#[derive(Debug, Clone)]
pub struct MockExecution {
    /// Script name.
    pub script_name: String,
    /// Run id passed in the launch options.
    pub run_id: String,
    /// Environment passed to the script.
    pub env: HashMap<String, String>,
    /// Contents of `DOMJOIN_BIND_PASSWORD_FILE`, read while the script "ran".
    pub password_file_contents: Option<String>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
}

/// Mock runner for testing.
pub struct MockRunner {
    behaviors: Arc<Mutex<HashMap<String, MockBehavior>>>,
    executions: Arc<Mutex<Vec<MockExecution>>>,
    default_behavior: MockBehavior,
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner where every script succeeds.
    pub fn new() -> Self {
        Self::with_default(MockBehavior::Succeed)
    }

    /// Create a mock runner where every script fails by default.
    pub fn failing() -> Self {
        Self::with_default(MockBehavior::Fail("Mock failure".to_string()))
    }

    fn with_default(default_behavior: MockBehavior) -> Self {
        Self {
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            executions: Arc::new(Mutex::new(Vec::new())),
            default_behavior,
            execution_delay_ms: 10,
        }
    }

    /// Set the behavior of one script.
    pub async fn set_behavior(&self, script_name: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .await
            .insert(script_name.to_string(), behavior);
    }

    /// All executions so far, in order.
    pub async fn executions(&self) -> Vec<MockExecution> {
        self.executions.lock().await.clone()
    }

    /// Names of executed scripts, in order.
    pub async fn executed_names(&self) -> Vec<String> {
        self.executions
            .lock()
            .await
            .iter()
            .map(|e| e.script_name.clone())
            .collect()
    }

    /// Forget recorded executions.
    pub async fn clear_executions(&self) {
        self.executions.lock().await.clear();
    }
}

#[async_trait]
impl ScriptRunner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, script: &JoinScript, options: &LaunchOptions) -> Result<ScriptResult> {
        let start = std::time::Instant::now();

        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&script.name)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        if behavior == MockBehavior::SpawnError {
            return Err(RunnerError::Spawn {
                script: script.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }

        let password_file_contents = match options.env.get("DOMJOIN_BIND_PASSWORD_FILE") {
            Some(path) => tokio::fs::read_to_string(path).await.ok(),
            None => None,
        };

        self.executions.lock().await.push(MockExecution {
            script_name: script.name.clone(),
            run_id: options.run_id.clone(),
            env: options.env.clone(),
            password_file_contents,
            started_at: Utc::now(),
        });

        if behavior == MockBehavior::Hang {
            tokio::time::sleep(options.timeout).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            return Ok(ScriptResult::timed_out(
                options.timeout,
                duration_ms,
                String::new(),
                false,
            ));
        }

        // Simulate execution
        if self.execution_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.execution_delay_ms)).await;
        }

        let (status, message, exit_code) = match behavior {
            MockBehavior::Fail(message) => (RecordStatus::Failed, message, 1),
            MockBehavior::Skip => (RecordStatus::Skipped, "already satisfied".to_string(), 77),
            _ => (RecordStatus::Configured, "configured".to_string(), 0),
        };

        Ok(ScriptResult {
            output: format!("{}: {}\n", script.name, message),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
            exit_code: Some(exit_code),
            timed_out: false,
            truncated: false,
        })
    }
}
