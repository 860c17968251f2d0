// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domjoin Core - Domain Join Orchestration
//!
//! This crate joins a host to a directory domain by executing the join
//! scripts installed by system packages, in a deterministic order, while
//! keeping a durable per-script record so later runs only do what is left.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                 │
//! │                (domjoin-server HTTP API, domjoin-ctl)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     domjoin-core (This Crate)                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Script    │  │    Join     │  │ Credential  │  │   Script    │     │
//! │  │  Registry   │  │Orchestrator │  │    Gate     │  │   Runner    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │                              │
//!           │ Scan            │ Records, runs, lease         │ Spawn
//!           ▼                 ▼                              ▼
//! ┌──────────────────┐ ┌──────────────────────┐   ┌─────────────────────────┐
//! │ Scripts directory│ │       SQLite         │   │   Join script processes │
//! │  (NNname[.inst]) │ │ (join state, runs)   │   │   (own process group)   │
//! └──────────────────┘ └──────────────────────┘   └─────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `status` | Host join status and the run holding the lease, if any |
//! | `overview` | Every applicable script with its latest record |
//! | `start` | Full join against a domain controller (credentials required) |
//! | `run_scripts` | Run a subset of scripts, optionally forced |
//! | `progress` | Latest progress snapshot of a run |
//! | `wait` | Wait for a run to finish |
//! | `logview` | Combined output of the most recent run |
//! | `cancel` | Stop a run between scripts |
//! | `unjoin` | Forget all join records |
//!
//! # Run State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │  IDLE   │
//!                     └────┬────┘
//!                          │ lease acquired
//!                          ▼
//!                     ┌─────────┐
//!          ┌──────────│ RUNNING │──────────┐
//!          │          └────┬────┘          │
//!          │               │               │
//!  no errors│         errors│   cancel, registry or
//!          │               │   persistence failure
//!          ▼               ▼               ▼
//!   ┌───────────┐ ┌─────────────────────┐ ┌─────────┐
//!   │ COMPLETED │ │COMPLETED_WITH_ERRORS│ │ ABORTED │
//!   └───────────┘ └─────────────────────┘ └─────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DOMJOIN_SCRIPTS_DIR` | No | `/usr/lib/domjoin/scripts` | Join script directory |
//! | `DOMJOIN_STATE_PATH` | No | `.data/domjoin.db` | SQLite join state |
//! | `DOMJOIN_HOST_ROLE` | No | `memberserver` | Role of this host |
//! | `DOMJOIN_SCRIPT_TIMEOUT_SECS` | No | `300` | Per-script timeout |
//! | `DOMJOIN_OUTPUT_LIMIT_BYTES` | No | `65536` | Captured output per script |
//! | `DOMJOIN_SKIP_EXIT_CODE` | No | `77` | Exit code meaning "already satisfied" |
//! | `DOMJOIN_LEASE_TTL_SECS` | No | `90` | Run lease time-to-live |
//! | `DOMJOIN_AUTH_COMMAND` | No | - | External credential checker |
//! | `DOMJOIN_RUN_RETENTION` | No | `50` | Runs kept in the run history |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`credentials`]: Caller credentials and their validation
//! - [`error`]: Error types for orchestrator operations
//! - [`orchestrator`]: Run lifecycle and script execution loop
//! - [`progress`]: Progress snapshots for pollers
//! - [`registry`]: Join script discovery and due-ness
//! - [`run`]: Run states, errors and summaries
//! - [`runner`]: Script execution backends
//! - [`runtime`]: Embeddable runtime with crash recovery
//! - [`script`]: Join script, record and host status types
//! - [`store`]: Durable join state

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Caller credentials, authenticators and the per-run credential gate.
pub mod credentials;

/// Error types for orchestrator operations.
pub mod error;

/// Join run lifecycle.
pub mod orchestrator;

/// Progress reporting.
pub mod progress;

/// Join script discovery.
pub mod registry;

/// Run states, errors and summaries.
pub mod run;

/// Script execution backends (process, mock).
pub mod runner;

/// Embeddable runtime for the join orchestrator.
pub mod runtime;

/// Join script, record and host status types.
pub mod script;

/// Durable join state (SQLite).
pub mod store;

pub use config::Config;
pub use error::JoinError;
pub use orchestrator::JoinOrchestrator;
pub use runtime::JoinRuntime;
