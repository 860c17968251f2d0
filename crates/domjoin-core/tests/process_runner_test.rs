// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests running real shell scripts through the process runner.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use domjoin_core::credentials::StructuralAuthenticator;
use domjoin_core::orchestrator::JoinOrchestrator;
use domjoin_core::run::{ErrorKind, RunState};
use domjoin_core::runner::ProcessRunner;
use domjoin_core::script::RecordStatus;
use domjoin_core::store::{JoinStateStore, SqliteStateStore};
use tempfile::TempDir;

struct ProcessContext {
    scripts_dir: PathBuf,
    store: Arc<SqliteStateStore>,
    orchestrator: JoinOrchestrator,
    _temp_dir: TempDir,
}

async fn process_context(timeout: Duration) -> ProcessContext {
    let temp_dir = TempDir::new().unwrap();
    let scripts_dir = temp_dir.path().join("scripts");
    std::fs::create_dir(&scripts_dir).unwrap();

    let store = Arc::new(
        SqliteStateStore::from_path(temp_dir.path().join("state.db"))
            .await
            .unwrap(),
    );
    let mut config = test_config(&scripts_dir, temp_dir.path());
    config.script_timeout = timeout;
    let runner = Arc::new(ProcessRunner::from_config(&config));
    let orchestrator = JoinOrchestrator::new(
        config,
        store.clone(),
        runner,
        Arc::new(StructuralAuthenticator),
    );

    ProcessContext {
        scripts_dir,
        store,
        orchestrator,
        _temp_dir: temp_dir,
    }
}

#[tokio::test]
async fn test_hung_script_times_out_and_run_continues() {
    let ctx = process_context(Duration::from_secs(1)).await;
    write_script(&ctx.scripts_dir, "10hang", &["class=safe-rerun"], "sleep 30");
    write_script(&ctx.scripts_dir, "20after", &["class=safe-rerun"], "echo after-ran");

    let start = Instant::now();
    let started = ctx.orchestrator.run_scripts(&[], false, None).await.unwrap();
    let summary = ctx.orchestrator.wait(&started.run_id).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(15));
    assert_eq!(summary.state, RunState::CompletedWithErrors);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, ErrorKind::Timeout);
    assert_eq!(summary.errors[0].script_name.as_deref(), Some("hang"));
    assert_eq!(summary.outcomes[1].status, RecordStatus::Configured);

    let record = ctx.store.get("hang").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert!(record.last_result_message.contains("timed out"));

    let log = ctx.orchestrator.logview().await.unwrap();
    assert!(log.contains("after-ran"));
}

#[tokio::test]
async fn test_exit_codes_map_to_record_status() {
    let ctx = process_context(Duration::from_secs(10)).await;
    write_script(&ctx.scripts_dir, "10ok", &["class=safe-rerun"], "echo configuring; exit 0");
    write_script(&ctx.scripts_dir, "20noop", &["class=safe-rerun"], "exit 77");
    write_script(
        &ctx.scripts_dir,
        "30broken",
        &["class=safe-rerun"],
        "echo 'ldap bind failed' >&2; exit 3",
    );

    let started = ctx.orchestrator.run_scripts(&[], false, None).await.unwrap();
    let summary = ctx.orchestrator.wait(&started.run_id).await.unwrap();

    let statuses: Vec<(&str, RecordStatus)> = summary
        .outcomes
        .iter()
        .map(|o| (o.script_name.as_str(), o.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("ok", RecordStatus::Configured),
            ("noop", RecordStatus::Skipped),
            ("broken", RecordStatus::Failed),
        ]
    );
    assert_eq!(summary.state, RunState::CompletedWithErrors);
    assert_eq!(summary.executed_count(), 2);
    assert_eq!(
        summary.errors[0].message,
        "exited with code 3: ldap bind failed"
    );

    let log = ctx.orchestrator.logview().await.unwrap();
    assert!(log.contains("configuring"));
    assert!(log.contains("ldap bind failed"));
}

#[tokio::test]
async fn test_scripts_receive_credentials_through_a_file() {
    let ctx = process_context(Duration::from_secs(10)).await;
    write_script(
        &ctx.scripts_dir,
        "10bind",
        &["class=run-once", "domain-bind"],
        r#"test "$DOMJOIN_BIND_USER" = admin || exit 2
test "$(cat "$DOMJOIN_BIND_PASSWORD_FILE")" = s3cret || exit 3
test "$DOMJOIN_DC_HOST" = dc1.example.org || exit 4
echo "bound as $DOMJOIN_BIND_USER""#,
    );

    let started = ctx
        .orchestrator
        .start("dc1.example.org", "admin", PASSWORD)
        .await
        .unwrap();
    let summary = ctx.orchestrator.wait(&started.run_id).await.unwrap();

    assert_eq!(summary.state, RunState::Completed, "{:?}", summary.errors);
    assert!(summary.joined);
    assert!(
        ctx.orchestrator
            .logview()
            .await
            .unwrap()
            .contains("bound as admin")
    );
}
