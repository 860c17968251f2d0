// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domjoin Server - HTTP API for Domain Join Orchestration
//!
//! Exposes a [`JoinOrchestrator`](domjoin_core::JoinOrchestrator) over a
//! small JSON API. Runs are started asynchronously; clients poll
//! `/join/progress/{run_id}` until `done` is `true`.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Liveness check |
//! | GET | `/join/status` | Host join status |
//! | GET | `/join/scripts` | Applicable scripts with their records |
//! | POST | `/join/start` | Full join (`hostname`, `username`, `password`) |
//! | POST | `/join/run` | Run scripts (`scripts`, `force`, optional credentials) |
//! | GET | `/join/progress/{run_id}` | Progress snapshot of a run |
//! | POST | `/join/runs/{run_id}/cancel` | Cancel a run between scripts |
//! | GET | `/join/logview` | Output of the most recent run, `text/plain` |
//! | POST | `/join/unjoin` | Forget all join records |
//!
//! # Errors
//!
//! Errors are returned as `{"code", "message"}` with `runId` on
//! `409 ALREADY_RUNNING` and `"critical": true` on `401 CREDENTIAL_REJECTED`.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DOMJOIN_HTTP_BIND` | `127.0.0.1` | Listen address |
//! | `DOMJOIN_HTTP_PORT` | `8010` | Listen port |
//!
//! The orchestrator itself is configured by the `DOMJOIN_*` variables
//! documented in `domjoin-core`.

#![deny(missing_docs)]

pub mod config;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod router;

pub use config::ServerConfig;
pub use error::ApiError;
pub use router::router;
