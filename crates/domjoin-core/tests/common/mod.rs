// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for domjoin-core integration tests.
//!
//! Provides TestContext with a temporary scripts directory, an on-disk
//! SQLite store, a mock runner and an orchestrator wired to them.

#![allow(dead_code)]

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use domjoin_core::config::Config;
use domjoin_core::credentials::{
    Authenticator, CredentialError, Credentials, StructuralAuthenticator,
};
use domjoin_core::orchestrator::JoinOrchestrator;
use domjoin_core::run::{RunState, RunSummary};
use domjoin_core::runner::{MockRunner, ScriptRunner};
use domjoin_core::script::{HostJoinStatus, JoinRecord};
use domjoin_core::store::{
    JoinStateStore, LeaseOutcome, PersistenceError, RunLease, SqliteStateStore, StoredRun,
};

pub const PASSWORD: &str = "s3cret";

/// Test context that owns the temp directories and the wired orchestrator.
pub struct TestContext {
    pub scripts_dir: PathBuf,
    pub store: Arc<SqliteStateStore>,
    pub runner: Arc<MockRunner>,
    pub orchestrator: JoinOrchestrator,
    _temp_dir: TempDir,
}

impl TestContext {
    /// Context with the standard script set and a mock runner.
    pub async fn new() -> Self {
        Self::with_runner(MockRunner::new()).await
    }

    pub async fn with_runner(runner: MockRunner) -> Self {
        Self::build(runner, |_| {}).await
    }

    /// Build a context, letting the caller adjust the config first.
    pub async fn build(runner: MockRunner, adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let scripts_dir = temp_dir.path().join("scripts");
        std::fs::create_dir(&scripts_dir).expect("Failed to create scripts dir");
        write_standard_scripts(&scripts_dir);

        let store = Arc::new(
            SqliteStateStore::from_path(temp_dir.path().join("state/domjoin.db"))
                .await
                .expect("Failed to open store"),
        );

        let mut config = test_config(&scripts_dir, temp_dir.path());
        adjust(&mut config);

        let runner = Arc::new(runner);
        let orchestrator = JoinOrchestrator::new(
            config,
            store.clone(),
            runner.clone() as Arc<dyn ScriptRunner>,
            Arc::new(StructuralAuthenticator),
        );

        Self {
            scripts_dir,
            store,
            runner,
            orchestrator,
            _temp_dir: temp_dir,
        }
    }

    /// Same store, scripts and runner, different authenticator.
    pub fn orchestrator_with(&self, authenticator: Arc<dyn Authenticator>) -> JoinOrchestrator {
        JoinOrchestrator::new(
            self.orchestrator.config().clone(),
            self.store.clone(),
            self.runner.clone() as Arc<dyn ScriptRunner>,
            authenticator,
        )
    }

    /// Run a full join to completion.
    pub async fn join(&self) -> RunSummary {
        let started = self
            .orchestrator
            .start("dc1.example.org", "admin", PASSWORD)
            .await
            .expect("start failed");
        self.orchestrator
            .wait(&started.run_id)
            .await
            .expect("wait failed")
    }

    /// Run scripts to completion.
    pub async fn run(
        &self,
        names: &[&str],
        force: bool,
        credentials: Option<Credentials>,
    ) -> RunSummary {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let started = self
            .orchestrator
            .run_scripts(&names, force, credentials)
            .await
            .expect("run_scripts failed");
        self.orchestrator
            .wait(&started.run_id)
            .await
            .expect("wait failed")
    }
}

pub fn test_config(scripts_dir: &Path, state_dir: &Path) -> Config {
    Config {
        scripts_dir: scripts_dir.to_path_buf(),
        state_path: state_dir.join("state/domjoin.db"),
        host_role: "memberserver".to_string(),
        script_timeout: Duration::from_secs(5),
        lease_ttl: Duration::from_secs(3),
        ..Config::default()
    }
}

pub fn admin() -> Credentials {
    Credentials::new("admin", PASSWORD)
}

/// Write an executable join script with `# domjoin:` header directives.
pub fn write_script(dir: &Path, file_name: &str, directives: &[&str], body: &str) {
    let mut content = String::from("#!/bin/sh\n");
    for directive in directives {
        content.push_str(&format!("# domjoin: {}\n", directive));
    }
    content.push_str(body);
    content.push('\n');

    let path = dir.join(file_name);
    std::fs::write(&path, content).expect("Failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod script");
}

/// The script set most tests use:
///
/// | Script | Class | Notes |
/// |--------|-------|-------|
/// | bind-domain | run-once | domain bind |
/// | register-dns | run-once | |
/// | sync-time | safe-rerun | |
/// | reset-acl | requires-force | |
/// | replicate-sysvol | run-once | domain controllers only |
pub fn write_standard_scripts(dir: &Path) {
    write_script(dir, "10bind-domain", &["class=run-once", "domain-bind"], "exit 0");
    write_script(dir, "20register-dns", &["class=run-once"], "exit 0");
    write_script(dir, "30sync-time", &["class=safe-rerun"], "exit 0");
    write_script(dir, "40reset-acl", &["class=requires-force"], "exit 0");
    write_script(
        dir,
        "50replicate-sysvol",
        &["class=run-once", "roles=domaincontroller_master"],
        "exit 0",
    );
}

/// Poll until `predicate` holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Authenticator that rejects everything and counts calls.
#[derive(Default)]
pub struct RejectingAuthenticator {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Authenticator for RejectingAuthenticator {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    async fn authenticate(
        &self,
        _credentials: &Credentials,
        _dc_host: Option<&str>,
    ) -> Result<(), CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CredentialError::Rejected(
            "invalid username or password".to_string(),
        ))
    }
}

/// Store wrapper whose record writes fail while `fail_puts` is set, or
/// for the scripts named in `fail_scripts`. Run saves fail while
/// `fail_run_saves` is set.
pub struct FlakyStore {
    pub inner: Arc<SqliteStateStore>,
    pub fail_puts: AtomicBool,
    pub fail_scripts: Mutex<HashSet<String>>,
    pub fail_run_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStateStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            fail_scripts: Mutex::new(HashSet::new()),
            fail_run_saves: AtomicBool::new(false),
        }
    }

    /// Make record writes fail for exactly these scripts.
    pub fn fail_writes_for(&self, scripts: &[&str]) {
        let mut failing = self.fail_scripts.lock().unwrap();
        failing.clear();
        failing.extend(scripts.iter().map(|s| s.to_string()));
    }
}

#[async_trait]
impl JoinStateStore for FlakyStore {
    async fn get(&self, script_name: &str) -> Result<Option<JoinRecord>, PersistenceError> {
        self.inner.get(script_name).await
    }

    async fn list_records(&self) -> Result<Vec<JoinRecord>, PersistenceError> {
        self.inner.list_records().await
    }

    async fn put(&self, record: &JoinRecord) -> Result<(), PersistenceError> {
        if self.fail_puts.load(Ordering::SeqCst)
            || self.fail_scripts.lock().unwrap().contains(&record.script_name)
        {
            return Err(PersistenceError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put(record).await
    }

    async fn get_host_status(&self) -> Result<HostJoinStatus, PersistenceError> {
        self.inner.get_host_status().await
    }

    async fn set_host_status(&self, status: &HostJoinStatus) -> Result<(), PersistenceError> {
        self.inner.set_host_status(status).await
    }

    async fn clear_join_state(&self) -> Result<(), PersistenceError> {
        self.inner.clear_join_state().await
    }

    async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LeaseOutcome, PersistenceError> {
        self.inner.acquire_lease(run_id, owner, ttl).await
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, PersistenceError> {
        self.inner.renew_lease(run_id, owner, ttl).await
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), PersistenceError> {
        self.inner.release_lease(run_id, owner).await
    }

    async fn current_lease(&self) -> Result<Option<RunLease>, PersistenceError> {
        self.inner.current_lease().await
    }

    async fn save_run(&self, summary: &RunSummary, log: &str) -> Result<(), PersistenceError> {
        if self.fail_run_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save_run(summary, log).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, PersistenceError> {
        self.inner.get_run(run_id).await
    }

    async fn latest_run(&self) -> Result<Option<StoredRun>, PersistenceError> {
        self.inner.latest_run().await
    }

    async fn list_runs_in_state(
        &self,
        state: RunState,
    ) -> Result<Vec<StoredRun>, PersistenceError> {
        self.inner.list_runs_in_state(state).await
    }

    async fn prune_runs(&self, keep: usize) -> Result<u64, PersistenceError> {
        self.inner.prune_runs(keep).await
    }
}
