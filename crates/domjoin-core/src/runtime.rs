// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the join orchestrator.
//!
//! [`JoinRuntime`] wires the state store, script runner and authenticator
//! together, recovers runs interrupted by a previous crash, and keeps a
//! background sweeper that aborts runs whose owning process died and trims
//! the run history to `Config::run_retention`.
//!
//! ```rust,ignore
//! use domjoin_core::config::Config;
//! use domjoin_core::runtime::JoinRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = JoinRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let run = runtime.orchestrator().start("dc1.example.org", "admin", "secret").await?;
//!     let summary = runtime.orchestrator().wait(&run.run_id).await?;
//!     println!("{:?}", summary.state);
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::credentials::{Authenticator, CommandAuthenticator, StructuralAuthenticator};
use crate::orchestrator::JoinOrchestrator;
use crate::runner::{ProcessRunner, ScriptRunner};
use crate::store::{JoinStateStore, SqliteStateStore};

/// Builder for creating a [`JoinRuntime`].
pub struct JoinRuntimeBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn JoinStateStore>>,
    runner: Option<Arc<dyn ScriptRunner>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    recovery_interval: Option<Duration>,
    shutdown_grace: Duration,
}

impl Default for JoinRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            store: None,
            runner: None,
            authenticator: None,
            recovery_interval: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl JoinRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the join state store.
    ///
    /// Default: a [`SqliteStateStore`] at `config.state_path`.
    pub fn store(mut self, store: Arc<dyn JoinStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the script runner.
    ///
    /// Default: a [`ProcessRunner`] built from the configuration.
    pub fn runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the authenticator.
    ///
    /// Default: [`CommandAuthenticator`] when `config.auth_command` is set,
    /// otherwise [`StructuralAuthenticator`].
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Set how often runs orphaned by dead processes are swept.
    ///
    /// Default: the lease TTL.
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    /// Set how long shutdown waits for a cancelled run to stop.
    ///
    /// Default: 30 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<JoinRuntimeConfig> {
        let config = self.config.unwrap_or_default();
        if config.lease_ttl < Duration::from_secs(1) {
            anyhow::bail!("lease_ttl must be at least one second");
        }

        let runner: Arc<dyn ScriptRunner> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(ProcessRunner::from_config(&config)),
        };
        let authenticator: Arc<dyn Authenticator> = match (self.authenticator, &config.auth_command) {
            (Some(authenticator), _) => authenticator,
            (None, Some(command)) => Arc::new(CommandAuthenticator::new(command.clone())),
            (None, None) => Arc::new(StructuralAuthenticator),
        };

        Ok(JoinRuntimeConfig {
            recovery_interval: self.recovery_interval.unwrap_or(config.lease_ttl),
            config,
            store: self.store,
            runner,
            authenticator,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// Configuration for a [`JoinRuntime`].
pub struct JoinRuntimeConfig {
    config: Config,
    store: Option<Arc<dyn JoinStateStore>>,
    runner: Arc<dyn ScriptRunner>,
    authenticator: Arc<dyn Authenticator>,
    recovery_interval: Duration,
    shutdown_grace: Duration,
}

impl JoinRuntimeConfig {
    /// Open the store, recover interrupted runs and start the sweeper.
    pub async fn start(self) -> Result<JoinRuntime> {
        let store: Arc<dyn JoinStateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStateStore::from_path(&self.config.state_path).await?),
        };

        info!(
            scripts_dir = %self.config.scripts_dir.display(),
            state_path = %self.config.state_path.display(),
            host_role = %self.config.host_role,
            runner = self.runner.runner_type(),
            authenticator = self.authenticator.name(),
            "Starting join runtime"
        );

        let orchestrator = JoinOrchestrator::new(self.config, store, self.runner, self.authenticator);

        match orchestrator.recover_interrupted_runs().await {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "Recovered interrupted join runs"),
            Err(e) => warn!(error = %e, "Failed to recover interrupted join runs"),
        }
        match orchestrator.prune_run_history().await {
            Ok(0) => {}
            Ok(n) => info!(deleted = n, "Pruned join run history"),
            Err(e) => warn!(error = %e, "Failed to prune join run history"),
        }

        let shutdown = Arc::new(Notify::new());
        let sweeper = RecoverySweeper {
            orchestrator: orchestrator.clone(),
            interval: self.recovery_interval,
            shutdown: shutdown.clone(),
        };
        let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

        Ok(JoinRuntime {
            orchestrator,
            sweeper_handle,
            sweeper_shutdown: shutdown,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// Periodically aborts runs whose owning process went away and deletes
/// finished runs past the retention.
struct RecoverySweeper {
    orchestrator: JoinOrchestrator,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl RecoverySweeper {
    async fn run(&self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    match self.orchestrator.recover_interrupted_runs().await {
                        Ok(0) => {}
                        Ok(n) => info!(recovered = n, "Recovered orphaned join runs"),
                        Err(e) => error!(error = %e, "Failed to sweep orphaned join runs"),
                    }
                    match self.orchestrator.prune_run_history().await {
                        Ok(0) => {}
                        Ok(n) => info!(deleted = n, "Pruned join run history"),
                        Err(e) => error!(error = %e, "Failed to prune join run history"),
                    }
                }
            }
        }
    }
}

/// A running join orchestrator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct JoinRuntime {
    orchestrator: JoinOrchestrator,
    sweeper_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
    shutdown_grace: Duration,
}

impl JoinRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> JoinRuntimeBuilder {
        JoinRuntimeBuilder::new()
    }

    /// The orchestrator.
    pub fn orchestrator(&self) -> &JoinOrchestrator {
        &self.orchestrator
    }

    /// Check if the background sweeper is still running.
    pub fn is_running(&self) -> bool {
        !self.sweeper_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Live runs are cancelled between scripts; the script in flight is
    /// allowed to finish within the shutdown grace period.
    pub async fn shutdown(self) -> Result<()> {
        info!("Join runtime shutting down...");

        self.orchestrator.shutdown(self.shutdown_grace).await;
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("Recovery sweeper task panicked: {}", e);
            return Err(anyhow::anyhow!("recovery sweeper panicked: {}", e));
        }

        info!("Join runtime shutdown complete");
        Ok(())
    }
}
