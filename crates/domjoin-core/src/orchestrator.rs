// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The join orchestrator.
//!
//! A run moves through `Running` to one of `Completed`,
//! `CompletedWithErrors` or `Aborted`. Only one run may hold the host's run
//! lease at a time; `start`/`run_scripts` return as soon as the lease is
//! acquired and the scripts execute on a background task. Callers follow the
//! run through [`JoinOrchestrator::progress`] or [`JoinOrchestrator::wait`].
//!
//! Per-script failures never surface as errors of these calls. They are
//! recorded in the join state store and in the run summary.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::credentials::{
    Authenticator, CredentialError, CredentialGate, Credentials, ValidatedCredentials,
};
use crate::error::{JoinError, Result};
use crate::progress::{Progress, ProgressReporter, ProgressSnapshot};
use crate::registry::{ScriptOverview, ScriptRegistry, due_scripts};
use crate::run::{ErrorKind, RunError, RunKind, RunState, RunSummary, ScriptOutcome};
use crate::runner::{CancelToken, LaunchOptions, ScriptRunner};
use crate::script::{
    HostJoinStatus, IdempotencyClass, JoinRecord, JoinScript, RecordStatus,
};
use crate::store::{JoinStateStore, LeaseOutcome, RunLease};

/// Consecutive failed state writes after which a run aborts.
pub const MAX_PERSISTENCE_STREAK: u32 = 3;

/// Finished runs kept in memory before older ones are dropped (they remain
/// in the store).
const MAX_FINISHED_LIVE_RUNS: usize = 16;

/// Lease token prefix marking an unjoin rather than a run.
const UNJOIN_LEASE_PREFIX: &str = "unjoin-";

/// Interval at which `wait` polls the store for runs owned elsewhere.
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Environment variables handed to join scripts.
pub mod script_env {
    /// Run identifier.
    pub const RUN_ID: &str = "DOMJOIN_RUN_ID";
    /// Role of this host.
    pub const HOST_ROLE: &str = "DOMJOIN_HOST_ROLE";
    /// Domain controller, when known.
    pub const DC_HOST: &str = "DOMJOIN_DC_HOST";
    /// Whether the run was forced (`1` or `0`).
    pub const FORCE: &str = "DOMJOIN_FORCE";
    /// Bind account (credentialed scripts only).
    pub const BIND_USER: &str = "DOMJOIN_BIND_USER";
    /// Path of a `0600` file holding the bind password (credentialed scripts only).
    pub const BIND_PASSWORD_FILE: &str = "DOMJOIN_BIND_PASSWORD_FILE";
}

/// Ephemeral per-run context. Never persisted.
pub struct RunContext {
    /// Caller's credentials, held for this run only.
    pub credentials: CredentialGate,
    /// Re-run scripts that would otherwise be skipped.
    pub force: bool,
    /// Subset of scripts to run; empty means every due script.
    pub requested_scripts: Vec<String>,
    /// Domain controller for this run.
    pub dc_host: Option<String>,
}

/// Response of `start`/`run_scripts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    /// Identifier to poll.
    pub run_id: String,
}

/// Join status of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinStatus {
    /// Whether the host is joined.
    pub joined: bool,
    /// Whether a run currently holds the lease.
    pub running: bool,
    /// The running run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// When the host became joined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<chrono::DateTime<Utc>>,
    /// Domain controller used for the bind.
    pub domain_controller_host: String,
    /// Errors of the most recent full join run.
    pub last_full_run_errors: Vec<RunError>,
}

/// In-process state of a run started by this orchestrator.
struct LiveRun {
    reporter: ProgressReporter,
    cancel: CancelToken,
    log: Mutex<String>,
    /// Set once the script loop is over; later cancellations are refused.
    sealed: Mutex<bool>,
    summary: OnceLock<RunSummary>,
}

impl LiveRun {
    fn new(run_id: &str) -> Self {
        Self {
            reporter: ProgressReporter::new(run_id),
            cancel: Arc::new(AtomicBool::new(false)),
            log: Mutex::new(String::new()),
            sealed: Mutex::new(false),
            summary: OnceLock::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.summary.get().is_some()
    }

    async fn wait(&self) -> Option<RunSummary> {
        let mut rx = self.reporter.subscribe();
        // The sender lives as long as `self`, so this only fails if it is dropped.
        let _ = rx.wait_for(|snapshot| snapshot.done).await;
        self.summary.get().cloned()
    }
}

/// Drives join runs on this host.
#[derive(Clone)]
pub struct JoinOrchestrator {
    config: Arc<Config>,
    registry: ScriptRegistry,
    store: Arc<dyn JoinStateStore>,
    runner: Arc<dyn ScriptRunner>,
    authenticator: Arc<dyn Authenticator>,
    owner: Arc<str>,
    live: Arc<Mutex<HashMap<String, Arc<LiveRun>>>>,
}

impl JoinOrchestrator {
    /// Create an orchestrator. Scripts are discovered in `config.scripts_dir`.
    pub fn new(
        config: Config,
        store: Arc<dyn JoinStateStore>,
        runner: Arc<dyn ScriptRunner>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let owner = format!("pid-{}-{}", std::process::id(), Uuid::new_v4());
        Self {
            registry: ScriptRegistry::new(config.scripts_dir.clone()),
            config: Arc::new(config),
            store,
            runner,
            authenticator,
            owner: owner.into(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token identifying this orchestrator as a lease owner.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Host join status and whether a run is in progress.
    pub async fn status(&self) -> Result<JoinStatus> {
        let host = self.store.get_host_status().await?;
        let lease = self.store.current_lease().await?;

        Ok(JoinStatus {
            joined: host.joined,
            running: lease.is_some(),
            run_id: lease
                .map(|l| l.run_id)
                .filter(|id| !id.starts_with(UNJOIN_LEASE_PREFIX)),
            joined_at: host.joined_at,
            domain_controller_host: host.domain_controller_host,
            last_full_run_errors: host.last_full_run_errors,
        })
    }

    /// Status grid of every script applicable to this host.
    pub async fn overview(&self) -> Result<Vec<ScriptOverview>> {
        Ok(self
            .registry
            .overview(&self.config.host_role, self.store.as_ref())
            .await?)
    }

    /// Begin a full join: the domain bind plus every due script.
    ///
    /// Credentials are validated before the lease is taken, so a rejected
    /// password never starts a run.
    pub async fn start(&self, hostname: &str, username: &str, password: &str) -> Result<RunStarted> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(JoinError::InvalidRequest(
                "domain controller hostname is required".to_string(),
            ));
        }
        if username.trim().is_empty() {
            return Err(JoinError::InvalidRequest("username is required".to_string()));
        }
        if password.is_empty() {
            return Err(JoinError::InvalidRequest("password is required".to_string()));
        }

        self.ensure_not_running().await?;

        let gate = CredentialGate::new(
            Some(Credentials::new(username.trim(), password)),
            Some(hostname.to_string()),
            self.authenticator.clone(),
        );
        gate.validate().await?;

        let context = RunContext {
            credentials: gate,
            force: false,
            requested_scripts: Vec::new(),
            dc_host: Some(hostname.to_string()),
        };
        self.launch(RunKind::Join, context).await
    }

    /// Run a named subset of scripts (all due scripts when `script_names` is
    /// empty). Credentials are optional; when supplied they are validated up
    /// front.
    pub async fn run_scripts(
        &self,
        script_names: &[String],
        force: bool,
        credentials: Option<Credentials>,
    ) -> Result<RunStarted> {
        if let Some(name) = script_names.iter().find(|n| n.trim().is_empty()) {
            return Err(JoinError::InvalidRequest(format!(
                "invalid script name '{}'",
                name
            )));
        }

        self.ensure_not_running().await?;

        let host = self.store.get_host_status().await?;
        let dc_host = Some(host.domain_controller_host).filter(|h| !h.is_empty());

        let has_credentials = credentials.is_some();
        let gate = CredentialGate::new(credentials, dc_host.clone(), self.authenticator.clone());
        if has_credentials {
            gate.validate().await?;
        }

        let mut requested = Vec::new();
        for name in script_names.iter().map(|n| n.trim().to_string()) {
            if !requested.contains(&name) {
                requested.push(name);
            }
        }

        let context = RunContext {
            credentials: gate,
            force,
            requested_scripts: requested,
            dc_host,
        };
        self.launch(RunKind::Scripts, context).await
    }

    /// Latest progress of a run.
    pub async fn progress(&self, run_id: &str) -> Result<ProgressSnapshot> {
        if let Some(live) = self.live_run(run_id).await {
            return Ok(live.reporter.snapshot());
        }
        match self.store.get_run(run_id).await? {
            Some(stored) => Ok(ProgressSnapshot::from_summary(&stored.summary)),
            None => Err(JoinError::RunNotFound(run_id.to_string())),
        }
    }

    /// Wait for a run to finish and return its summary.
    pub async fn wait(&self, run_id: &str) -> Result<RunSummary> {
        if let Some(live) = self.live_run(run_id).await
            && let Some(summary) = live.wait().await
        {
            return Ok(summary);
        }

        // Run owned by another process (or finished before we were asked).
        loop {
            let Some(stored) = self.store.get_run(run_id).await? else {
                return Err(JoinError::RunNotFound(run_id.to_string()));
            };
            if stored.summary.state.is_terminal() {
                return Ok(stored.summary);
            }
            tokio::time::sleep(STORE_POLL_INTERVAL).await;
        }
    }

    /// Combined script output of the most recent run.
    pub async fn logview(&self) -> Result<String> {
        let Some(latest) = self.store.latest_run().await? else {
            return Ok(String::new());
        };
        if let Some(live) = self.live_run(&latest.summary.run_id).await {
            return Ok(live.log.lock().await.clone());
        }
        Ok(latest.log)
    }

    /// Request cancellation of a run. The script in flight finishes first;
    /// a run cancelled during its last script still ends `Aborted`.
    ///
    /// Returns `false` if the run already finished its scripts.
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        if let Some(live) = self.live_run(run_id).await {
            let sealed = live.sealed.lock().await;
            if *sealed || live.is_done() {
                return Ok(false);
            }
            live.cancel.store(true, Ordering::SeqCst);
            drop(sealed);
            info!(run_id = %run_id, "Cancellation requested");
            return Ok(true);
        }

        match self.store.get_run(run_id).await? {
            Some(stored) if stored.summary.state.is_terminal() => Ok(false),
            Some(_) => Err(JoinError::InvalidRequest(format!(
                "run {} is owned by another process",
                run_id
            ))),
            None => Err(JoinError::RunNotFound(run_id.to_string())),
        }
    }

    /// Forget every join record and mark the host not joined.
    ///
    /// Rejected with `AlreadyRunning` while a run holds the lease, and with
    /// `UnjoinInProgress` while another unjoin does.
    pub async fn unjoin(&self) -> Result<()> {
        let token = format!("{}{}", UNJOIN_LEASE_PREFIX, Uuid::new_v4());
        match self
            .store
            .acquire_lease(&token, &self.owner, self.config.lease_ttl)
            .await?
        {
            LeaseOutcome::Held(lease) => return Err(lease_conflict(lease)),
            LeaseOutcome::Acquired => {}
        }

        let result = self.store.clear_join_state().await;
        if let Err(e) = self.store.release_lease(&token, &self.owner).await {
            warn!(error = %e, "Failed to release lease after unjoin");
        }
        result?;

        info!("Host unjoined; join records cleared");
        Ok(())
    }

    /// Mark runs left `running` by a dead process as aborted.
    ///
    /// A run whose lease is still live is left alone. Returns the number of
    /// runs recovered.
    pub async fn recover_interrupted_runs(&self) -> Result<usize> {
        let lease = self.store.current_lease().await?;
        let mut recovered = 0;

        for stored in self.store.list_runs_in_state(RunState::Running).await? {
            let run_id = stored.summary.run_id.clone();
            if lease.as_ref().is_some_and(|l| l.run_id == run_id)
                || self.live_run(&run_id).await.is_some()
            {
                continue;
            }

            let mut summary = stored.summary;
            summary.state = RunState::Aborted;
            summary.finished_at = Some(Utc::now());
            summary.errors.push(RunError::run_level(
                ErrorKind::Interrupted,
                "run was interrupted before it finished",
            ));
            self.store.save_run(&summary, &stored.log).await?;

            warn!(run_id = %run_id, "Marked interrupted run as aborted");
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Delete finished runs beyond the configured retention. The most recent
    /// run is always kept so the log view has something to show.
    pub async fn prune_run_history(&self) -> Result<u64> {
        let deleted = self.store.prune_runs(self.config.run_retention).await?;
        if deleted > 0 {
            debug!(
                deleted,
                retention = self.config.run_retention,
                "Pruned run history"
            );
        }
        Ok(deleted)
    }

    /// Cancel every live run and wait up to `grace` for each to finish.
    pub async fn shutdown(&self, grace: Duration) {
        let runs: Vec<(String, Arc<LiveRun>)> = self
            .live
            .lock()
            .await
            .iter()
            .filter(|(_, run)| !run.is_done())
            .map(|(id, run)| (id.clone(), run.clone()))
            .collect();

        for (run_id, run) in runs {
            run.cancel.store(true, Ordering::SeqCst);
            if tokio::time::timeout(grace, run.wait()).await.is_err() {
                warn!(run_id = %run_id, "Run did not stop before shutdown");
            }
        }
    }

    async fn live_run(&self, run_id: &str) -> Option<Arc<LiveRun>> {
        self.live.lock().await.get(run_id).cloned()
    }

    async fn ensure_not_running(&self) -> Result<()> {
        match self.store.current_lease().await? {
            Some(lease) => Err(lease_conflict(lease)),
            None => Ok(()),
        }
    }

    async fn launch(&self, kind: RunKind, context: RunContext) -> Result<RunStarted> {
        let run_id = Uuid::new_v4().to_string();

        match self
            .store
            .acquire_lease(&run_id, &self.owner, self.config.lease_ttl)
            .await?
        {
            LeaseOutcome::Held(lease) => return Err(lease_conflict(lease)),
            LeaseOutcome::Acquired => {}
        }

        let summary = RunSummary::new(&run_id, kind);
        if let Err(e) = self.store.save_run(&summary, "").await {
            if let Err(release_err) = self.store.release_lease(&run_id, &self.owner).await {
                warn!(run_id = %run_id, error = %release_err, "Failed to release run lease");
            }
            return Err(e.into());
        }

        let live = Arc::new(LiveRun::new(&run_id));
        self.register_live(&run_id, live.clone()).await;

        info!(
            run_id = %run_id,
            kind = kind.as_str(),
            force = context.force,
            "Join run started"
        );

        let orchestrator = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            orchestrator.supervise(id, summary, context, live).await;
        });

        Ok(RunStarted { run_id })
    }

    async fn register_live(&self, run_id: &str, run: Arc<LiveRun>) {
        let mut live = self.live.lock().await;
        let finished = live.values().filter(|r| r.is_done()).count();
        if finished >= MAX_FINISHED_LIVE_RUNS {
            live.retain(|_, r| !r.is_done());
        }
        live.insert(run_id.to_string(), run);
    }

    /// Run the script loop, then release the lease and publish the result.
    async fn supervise(
        self,
        run_id: String,
        summary: RunSummary,
        context: RunContext,
        live: Arc<LiveRun>,
    ) {
        let stop_renewal = Arc::new(Notify::new());
        let renewal = self.spawn_lease_renewal(run_id.clone(), stop_renewal.clone());

        let fallback = summary.clone();
        let worker = {
            let orchestrator = self.clone();
            let live = live.clone();
            tokio::spawn(async move { orchestrator.execute_run(summary, context, &live).await })
        };

        let mut summary = match worker.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(run_id = %run_id, "Join run task panicked: {}", e);
                let mut summary = fallback;
                summary.state = RunState::Aborted;
                summary.errors.push(RunError::run_level(
                    ErrorKind::Interrupted,
                    "run terminated unexpectedly",
                ));
                summary
            }
        };
        summary.finished_at = Some(Utc::now());

        stop_renewal.notify_one();
        let _ = renewal.await;

        if let Err(e) = self.store.release_lease(&run_id, &self.owner).await {
            warn!(run_id = %run_id, error = %e, "Failed to release run lease");
        }

        let log = live.log.lock().await.clone();
        if let Err(e) = self.store.save_run(&summary, &log).await {
            error!(run_id = %run_id, error = %e, "Failed to persist run summary");
        }

        info!(
            run_id = %run_id,
            state = %summary.state,
            executed = summary.executed_count(),
            errors = summary.errors.len(),
            joined = summary.joined,
            "Join run finished"
        );

        let _ = live.summary.set(summary.clone());
        live.reporter.finish(&summary);
    }

    fn spawn_lease_renewal(&self, run_id: String, stop: Arc<Notify>) -> JoinHandle<()> {
        let store = self.store.clone();
        let owner = self.owner.clone();
        let ttl = self.config.lease_ttl;
        let interval = ttl / 3;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = stop.notified() => break,

                    _ = tokio::time::sleep(interval) => {
                        match store.renew_lease(&run_id, &owner, ttl).await {
                            Ok(true) => debug!(run_id = %run_id, "Run lease renewed"),
                            Ok(false) => warn!(run_id = %run_id, "Run lease lost"),
                            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to renew run lease"),
                        }
                    }
                }
            }
        })
    }

    async fn execute_run(
        &self,
        mut summary: RunSummary,
        context: RunContext,
        live: &LiveRun,
    ) -> RunSummary {
        let reporter = &live.reporter;
        let role = self.config.host_role.as_str();

        reporter.update(Progress::Indeterminate, "Scanning join scripts", None);

        let previous = match self.store.get_host_status().await {
            Ok(status) => status,
            Err(e) => {
                return abort(
                    summary,
                    reporter,
                    RunError::run_level(
                        ErrorKind::Persistence,
                        format!("failed to read host status: {}", e),
                    ),
                );
            }
        };

        let scripts = match self.registry.list_scripts().await {
            Ok(scripts) => scripts,
            Err(e) => {
                return abort(
                    summary,
                    reporter,
                    RunError::run_level(ErrorKind::Registry, e.to_string()),
                );
            }
        };

        let applicable: Vec<&JoinScript> = scripts.iter().filter(|s| s.applies_to(role)).collect();
        let mut records: HashMap<String, JoinRecord> = HashMap::new();
        for script in &applicable {
            match self.store.get(&script.name).await {
                Ok(Some(record)) => {
                    records.insert(script.name.clone(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    return abort(
                        summary,
                        reporter,
                        RunError::run_level(
                            ErrorKind::Persistence,
                            format!("failed to read join records: {}", e),
                        ),
                    );
                }
            }
        }

        let mut due: Vec<&JoinScript> = due_scripts(&scripts, role, &records, context.force);

        if !context.requested_scripts.is_empty() {
            let requested: BTreeSet<&str> =
                context.requested_scripts.iter().map(String::as_str).collect();
            for name in &context.requested_scripts {
                if due.iter().any(|s| &s.name == name) {
                    continue;
                }
                let reason = match scripts.iter().find(|s| &s.name == name) {
                    Some(s) if !s.applies_to(role) => "not applicable",
                    None => "not applicable",
                    Some(s)
                        if s.idempotency_class == IdempotencyClass::RequiresForce
                            && !context.force =>
                    {
                        "requires force"
                    }
                    Some(_) => "already configured",
                };
                let warning = format!("{}: {}", name, reason);
                info!(run_id = %summary.run_id, warning = %warning, "Requested script not due");
                reporter.push_warning(warning.clone());
                summary.warnings.push(warning);
            }
            due.retain(|s| requested.contains(s.name.as_str()));
        }

        info!(
            run_id = %summary.run_id,
            due = due.len(),
            applicable = applicable.len(),
            "Join scripts resolved"
        );

        let total = due.len();
        let mut persistence_streak = 0u32;

        for (index, script) in due.iter().enumerate() {
            if live.cancel.load(Ordering::SeqCst) {
                let error = RunError::run_level(ErrorKind::Cancelled, "run cancelled");
                reporter.push_error(error.clone());
                summary.errors.push(error);
                summary.state = RunState::Aborted;
                break;
            }

            reporter.update(
                Progress::Percent(percent(index, total)),
                format!("Running {} ({}/{})", script.name, index + 1, total),
                Some(&script.name),
            );

            let (mut outcome, output) = self
                .run_script(script, &context, &summary.run_id)
                .await;

            let persisted_status = match (outcome.status, script.idempotency_class) {
                // Nothing left to do is the configured state for a one-shot step.
                (RecordStatus::Skipped, IdempotencyClass::RunOnce) => RecordStatus::Configured,
                (status, _) => status,
            };
            let record = JoinRecord {
                script_name: script.name.clone(),
                status: persisted_status,
                version: script.version,
                last_run_at: Utc::now(),
                last_result_message: outcome.message.clone(),
                attempts: records.get(&script.name).map_or(0, |r| r.attempts) + 1,
            };

            match self.store.put(&record).await {
                Ok(()) => {
                    persistence_streak = 0;
                    records.insert(script.name.clone(), record);
                }
                Err(e) => {
                    persistence_streak += 1;
                    warn!(
                        run_id = %summary.run_id,
                        script = %script.name,
                        error = %e,
                        streak = persistence_streak,
                        "Failed to record join script result"
                    );
                    outcome.status = RecordStatus::Failed;
                    outcome.error_kind = Some(ErrorKind::Persistence);
                    outcome.message = format!("{} (result not recorded: {})", outcome.message, e);
                }
            }

            {
                let mut log = live.log.lock().await;
                append_log(&mut log, &outcome, &output);
            }

            if let Some(error) = outcome.to_error() {
                reporter.push_error(error.clone());
                summary.errors.push(error);
            }
            summary.outcomes.push(outcome);

            if persistence_streak >= MAX_PERSISTENCE_STREAK {
                let error = RunError::run_level(
                    ErrorKind::Persistence,
                    format!(
                        "aborting after {} consecutive persistence errors",
                        persistence_streak
                    ),
                );
                reporter.push_error(error.clone());
                summary.errors.push(error);
                summary.state = RunState::Aborted;
                break;
            }

            reporter.update(
                Progress::Percent(percent(index + 1, total)),
                format!("Finished {}", script.name),
                Some(&script.name),
            );

            let log = live.log.lock().await.clone();
            if let Err(e) = self.store.save_run(&summary, &log).await {
                debug!(run_id = %summary.run_id, error = %e, "Failed to checkpoint run summary");
            }
        }

        // Cancelled while the last script was in flight.
        let cancelled = {
            let mut sealed = live.sealed.lock().await;
            *sealed = true;
            live.cancel.load(Ordering::SeqCst)
        };
        if summary.state != RunState::Aborted && cancelled {
            let error = RunError::run_level(ErrorKind::Cancelled, "run cancelled");
            reporter.push_error(error.clone());
            summary.errors.push(error);
            summary.state = RunState::Aborted;
        }

        if summary.state != RunState::Aborted {
            summary.state = if summary.errors.is_empty() {
                RunState::Completed
            } else {
                RunState::CompletedWithErrors
            };
        }

        let bind_failed = summary.outcomes.iter().any(|o| {
            o.status == RecordStatus::Failed
                && applicable
                    .iter()
                    .any(|s| s.name == o.script_name && s.domain_bind)
        });
        let run_once_configured = applicable
            .iter()
            .filter(|s| s.idempotency_class == IdempotencyClass::RunOnce)
            .all(|s| {
                records
                    .get(&s.name)
                    .is_some_and(|r| r.status == RecordStatus::Configured)
            });
        let satisfied = run_once_configured && !bind_failed;
        let joined = match (summary.kind, summary.state) {
            (RunKind::Join, state) if state != RunState::Aborted => satisfied,
            _ => previous.joined && satisfied,
        };

        let mut status = HostJoinStatus {
            joined,
            joined_at: match (previous.joined, joined) {
                (false, true) => Some(Utc::now()),
                (true, true) => previous.joined_at,
                (_, false) => None,
            },
            domain_controller_host: context
                .dc_host
                .clone()
                .unwrap_or_else(|| previous.domain_controller_host.clone()),
            last_full_run_errors: previous.last_full_run_errors.clone(),
        };
        if summary.kind == RunKind::Join {
            status.last_full_run_errors = summary.errors.clone();
        }

        summary.joined = status.joined;
        if status != previous
            && let Err(e) = self.store.set_host_status(&status).await
        {
            let error = RunError::run_level(
                ErrorKind::Persistence,
                format!("failed to record host status: {}", e),
            );
            reporter.push_error(error.clone());
            summary.errors.push(error);
            summary.joined = previous.joined;
            if summary.state == RunState::Completed {
                summary.state = RunState::CompletedWithErrors;
            }
        }

        summary
    }

    /// Execute one script and describe what happened. Never fails; every
    /// problem becomes a `Failed` outcome.
    async fn run_script(
        &self,
        script: &JoinScript,
        context: &RunContext,
        run_id: &str,
    ) -> (ScriptOutcome, String) {
        let failed = |kind: ErrorKind, message: String| ScriptOutcome {
            script_name: script.name.clone(),
            status: RecordStatus::Failed,
            message,
            duration_ms: 0,
            error_kind: Some(kind),
        };

        let credentials: Option<ValidatedCredentials> =
            match context.credentials.require_if_needed(script).await {
                Ok(credentials) => credentials,
                Err(CredentialError::Checker(reason)) => {
                    return (
                        failed(
                            ErrorKind::ScriptFailed,
                            format!("credential check failed: {}", reason),
                        ),
                        String::new(),
                    );
                }
                Err(e) => {
                    warn!(run_id = %run_id, script = %script.name, "Credentials unavailable for script");
                    return (
                        failed(ErrorKind::Credentials, format!("credentials: {}", e)),
                        String::new(),
                    );
                }
            };

        let mut env = HashMap::from([
            (script_env::RUN_ID.to_string(), run_id.to_string()),
            (script_env::HOST_ROLE.to_string(), self.config.host_role.clone()),
            (
                script_env::FORCE.to_string(),
                if context.force { "1" } else { "0" }.to_string(),
            ),
        ]);
        if let Some(host) = &context.dc_host {
            env.insert(script_env::DC_HOST.to_string(), host.clone());
        }

        // Dropped (and deleted) once the script has finished.
        let _password_file = match &credentials {
            Some(credentials) => match credentials.write_password_file() {
                Ok(file) => {
                    env.insert(
                        script_env::BIND_USER.to_string(),
                        credentials.username().to_string(),
                    );
                    env.insert(
                        script_env::BIND_PASSWORD_FILE.to_string(),
                        file.path().display().to_string(),
                    );
                    Some(file)
                }
                Err(e) => {
                    return (
                        failed(
                            ErrorKind::ScriptFailed,
                            format!("failed to prepare credentials: {}", e),
                        ),
                        String::new(),
                    );
                }
            },
            None => None,
        };

        let options = LaunchOptions {
            run_id: run_id.to_string(),
            env,
            timeout: self.config.script_timeout,
        };

        match self.runner.execute(script, &options).await {
            Ok(result) => {
                let error_kind = (result.status == RecordStatus::Failed).then_some(
                    if result.timed_out {
                        ErrorKind::Timeout
                    } else {
                        ErrorKind::ScriptFailed
                    },
                );
                (
                    ScriptOutcome {
                        script_name: script.name.clone(),
                        status: result.status,
                        message: result.message,
                        duration_ms: result.duration_ms,
                        error_kind,
                    },
                    result.output,
                )
            }
            Err(e) => {
                warn!(run_id = %run_id, script = %script.name, error = %e, "Join script could not run");
                (failed(ErrorKind::ScriptFailed, e.to_string()), String::new())
            }
        }
    }
}

/// Error for a lease someone else holds. Unjoin leases have no run record,
/// so they are not reported as a run to attach to.
fn lease_conflict(lease: RunLease) -> JoinError {
    if lease.run_id.starts_with(UNJOIN_LEASE_PREFIX) {
        JoinError::UnjoinInProgress
    } else {
        JoinError::AlreadyRunning {
            run_id: lease.run_id,
        }
    }
}

fn abort(mut summary: RunSummary, reporter: &ProgressReporter, error: RunError) -> RunSummary {
    error!(run_id = %summary.run_id, error = %error.message, "Join run aborted");
    reporter.push_error(error.clone());
    summary.errors.push(error);
    summary.state = RunState::Aborted;
    summary
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

fn append_log(log: &mut String, outcome: &ScriptOutcome, output: &str) {
    log.push_str(&format!("=== {} ===\n", outcome.script_name));
    log.push_str(output);
    if !output.is_empty() && !output.ends_with('\n') {
        log.push('\n');
    }
    log.push_str(&format!(
        "=== {}: {} ({}, {} ms) ===\n",
        outcome.script_name, outcome.status, outcome.message, outcome.duration_ms
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(4, 4), 100);
        assert_eq!(percent(1, 3), 33);
    }

    #[test]
    fn test_append_log_frames_output() {
        let mut log = String::new();
        let outcome = ScriptOutcome {
            script_name: "bind-domain".to_string(),
            status: RecordStatus::Configured,
            message: "configured".to_string(),
            duration_ms: 12,
            error_kind: None,
        };
        append_log(&mut log, &outcome, "joined dc1");

        assert_eq!(
            log,
            "=== bind-domain ===\njoined dc1\n=== bind-domain: configured (configured, 12 ms) ===\n"
        );
    }
}
