// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API tests.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`
//! against an orchestrator backed by a temporary SQLite store and a mock
//! runner.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use domjoin_core::config::Config;
use domjoin_core::credentials::{
    Authenticator, CredentialError, Credentials, StructuralAuthenticator,
};
use domjoin_core::orchestrator::JoinOrchestrator;
use domjoin_core::runner::{MockRunner, ScriptRunner};
use domjoin_core::store::SqliteStateStore;
use domjoin_server::router;

struct ApiContext {
    app: Router,
    orchestrator: JoinOrchestrator,
    runner: Arc<MockRunner>,
    _temp_dir: TempDir,
}

impl ApiContext {
    async fn new() -> Self {
        Self::build(MockRunner::new(), Arc::new(StructuralAuthenticator)).await
    }

    async fn build(runner: MockRunner, authenticator: Arc<dyn Authenticator>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let scripts_dir = temp_dir.path().join("scripts");
        std::fs::create_dir(&scripts_dir).expect("Failed to create scripts dir");
        write_script(&scripts_dir, "10bind-domain", &["class=run-once", "domain-bind"]);
        write_script(&scripts_dir, "20register-dns", &["class=run-once"]);
        write_script(&scripts_dir, "30sync-time", &["class=safe-rerun"]);
        write_script(
            &scripts_dir,
            "50replicate-sysvol",
            &["class=run-once", "roles=domaincontroller_master"],
        );

        let state_path = temp_dir.path().join("state/domjoin.db");
        let store = Arc::new(
            SqliteStateStore::from_path(&state_path)
                .await
                .expect("Failed to open store"),
        );
        let config = Config {
            scripts_dir,
            state_path,
            host_role: "memberserver".to_string(),
            script_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(3),
            ..Config::default()
        };

        let runner = Arc::new(runner);
        let orchestrator = JoinOrchestrator::new(
            config,
            store,
            runner.clone() as Arc<dyn ScriptRunner>,
            authenticator,
        );

        Self {
            app: router(orchestrator.clone()),
            orchestrator,
            runner,
            _temp_dir: temp_dir,
        }
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.post_raw(uri, body.to_string()).await
    }

    async fn post_raw(&self, uri: &str, body: String) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn start_join(&self) -> String {
        let (status, body) = self
            .post(
                "/join/start",
                json!({"hostname": "dc1.example.org", "username": "admin", "password": "s3cret"}),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {}", body);
        body["runId"].as_str().unwrap().to_string()
    }

    /// Poll the progress endpoint until the run reports `done`.
    async fn poll_until_done(&self, run_id: &str) -> Value {
        for _ in 0..250 {
            let (status, body) = self.get(&format!("/join/progress/{}", run_id)).await;
            assert_eq!(status, StatusCode::OK);
            if body["done"] == Value::Bool(true) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {} did not finish", run_id);
    }
}

fn write_script(dir: &Path, file_name: &str, directives: &[&str]) {
    let mut content = String::from("#!/bin/sh\n");
    for directive in directives {
        content.push_str(&format!("# domjoin: {}\n", directive));
    }
    content.push_str("exit 0\n");

    let path = dir.join(file_name);
    std::fs::write(&path, content).expect("Failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod script");
}

fn slow_runner(delay_ms: u64) -> MockRunner {
    let mut runner = MockRunner::new();
    runner.execution_delay_ms = delay_ms;
    runner
}

struct RejectingAuthenticator;

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
        Err(CredentialError::Rejected(
            "invalid username or password".to_string(),
        ))
    }
}

#[tokio::test]
async fn test_health() {
    let ctx = ApiContext::new().await;

    let (status, body) = ctx.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_join_then_poll_progress() {
    let ctx = ApiContext::new().await;

    let (status, body) = ctx.get("/join/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["joined"], false);
    assert_eq!(body["running"], false);

    let run_id = ctx.start_join().await;
    let progress = ctx.poll_until_done(&run_id).await;
    assert_eq!(progress["runId"], run_id.as_str());
    assert_eq!(progress["state"], "completed");
    assert_eq!(progress["percentage"], 100);
    assert_eq!(progress["errors"], json!([]));

    let (_, body) = ctx.get("/join/status").await;
    assert_eq!(body["joined"], true);
    assert_eq!(body["running"], false);
    assert_eq!(body["domainControllerHost"], "dc1.example.org");
    assert!(body["joinedAt"].is_string());

    assert_eq!(
        ctx.runner.executed_names().await,
        vec!["bind-domain", "register-dns", "sync-time"]
    );
}

#[tokio::test]
async fn test_scripts_overview() {
    let ctx = ApiContext::new().await;

    let (status, body) = ctx.get("/join/scripts").await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["bind-domain", "register-dns", "sync-time"]);
    assert_eq!(body[0]["status"], "pending");
    assert_eq!(body[0]["due"], true);
}

#[tokio::test]
async fn test_second_start_conflicts_while_running() {
    let ctx = ApiContext::build(slow_runner(300), Arc::new(StructuralAuthenticator)).await;

    let run_id = ctx.start_join().await;
    let (status, body) = ctx
        .post(
            "/join/start",
            json!({"hostname": "dc1.example.org", "username": "admin", "password": "s3cret"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_RUNNING");
    assert_eq!(body["runId"], run_id.as_str());

    let (status, body) = ctx.post("/join/unjoin", Value::Null).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["runId"], run_id.as_str());

    let (_, status_body) = ctx.get("/join/status").await;
    assert_eq!(status_body["running"], true);
    assert_eq!(status_body["runId"], run_id.as_str());

    ctx.orchestrator.wait(&run_id).await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_are_critical() {
    let ctx = ApiContext::build(MockRunner::new(), Arc::new(RejectingAuthenticator)).await;

    let (status, body) = ctx
        .post(
            "/join/start",
            json!({"hostname": "dc1.example.org", "username": "admin", "password": "wrong"}),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "CREDENTIAL_REJECTED");
    assert_eq!(body["critical"], true);
    assert!(!body.to_string().contains("wrong"));

    let (_, status_body) = ctx.get("/join/status").await;
    assert_eq!(status_body["running"], false);
    assert!(ctx.runner.executions().await.is_empty());
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let ctx = ApiContext::new().await;

    let (status, body) = ctx.post_raw("/join/start", "{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = ctx
        .post("/join/start", json!({"hostname": "dc1.example.org"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = ctx
        .post("/join/run", json!({"scripts": ["sync-time"], "username": "admin"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("together"));

    assert!(ctx.runner.executions().await.is_empty());
}

#[tokio::test]
async fn test_run_selected_scripts() {
    let ctx = ApiContext::new().await;
    let run_id = ctx.start_join().await;
    ctx.poll_until_done(&run_id).await;
    ctx.runner.clear_executions().await;

    let (status, body) = ctx
        .post(
            "/join/run",
            json!({"scripts": ["register-dns"], "force": true}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["runId"].as_str().unwrap().to_string();

    let progress = ctx.poll_until_done(&run_id).await;
    assert_eq!(progress["state"], "completed");
    assert_eq!(ctx.runner.executed_names().await, vec!["register-dns"]);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let ctx = ApiContext::new().await;

    let (status, body) = ctx.get("/join/progress/no-such-run").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RUN_NOT_FOUND");

    let (status, _) = ctx.post("/join/runs/no-such-run/cancel", Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_run() {
    let ctx = ApiContext::build(slow_runner(200), Arc::new(StructuralAuthenticator)).await;

    let run_id = ctx.start_join().await;
    let (status, body) = ctx
        .post(&format!("/join/runs/{}/cancel", run_id), Value::Null)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"runId": run_id.clone(), "cancelled": true}));

    let progress = ctx.poll_until_done(&run_id).await;
    assert_eq!(progress["state"], "aborted");
    assert!(ctx.runner.executions().await.len() < 3);

    let (status, body) = ctx
        .post(&format!("/join/runs/{}/cancel", run_id), Value::Null)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_logview_is_plain_text() {
    let ctx = ApiContext::new().await;
    let run_id = ctx.start_join().await;
    ctx.poll_until_done(&run_id).await;

    let request = Request::get("/join/logview").body(Body::empty()).unwrap();
    let response = ctx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let log = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(log.contains("bind-domain"));
    assert!(log.contains("sync-time"));
}

#[tokio::test]
async fn test_unjoin() {
    let ctx = ApiContext::new().await;
    let run_id = ctx.start_join().await;
    ctx.poll_until_done(&run_id).await;

    let (status, body) = ctx.post("/join/unjoin", Value::Null).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (_, body) = ctx.get("/join/status").await;
    assert_eq!(body["joined"], false);

    let (_, scripts) = ctx.get("/join/scripts").await;
    assert!(
        scripts
            .as_array()
            .unwrap()
            .iter()
            .all(|row| row["status"] == "pending")
    );
}
