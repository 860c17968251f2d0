// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response bodies.
//!
//! Orchestrator types (`JoinStatus`, `ProgressSnapshot`, `ScriptOverview`,
//! `RunStarted`) are serialized as-is; only the request bodies and a few
//! small responses live here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `POST /join/start`
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Domain controller to join against.
    pub hostname: String,
    /// Bind account.
    pub username: String,
    /// Bind password.
    pub password: String,
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// `POST /join/run`
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunScriptsRequest {
    /// Scripts to run; empty runs every due script.
    pub scripts: Vec<String>,
    /// Re-run scripts that would otherwise be skipped.
    pub force: bool,
    /// Optional bind account.
    pub username: Option<String>,
    /// Optional bind password.
    pub password: Option<String>,
}

impl fmt::Debug for RunScriptsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunScriptsRequest")
            .field("scripts", &self.scripts)
            .field("force", &self.force)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// `POST /join/runs/{run_id}/cancel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    /// Run the request was for.
    pub run_id: String,
    /// `false` when the run had already finished.
    pub cancelled: bool,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: String,
    /// Server version.
    pub version: String,
}
