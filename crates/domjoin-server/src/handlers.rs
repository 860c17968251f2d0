// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers over the join orchestrator.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use tracing::info;

use domjoin_core::credentials::Credentials;
use domjoin_core::orchestrator::{JoinOrchestrator, JoinStatus, RunStarted};
use domjoin_core::progress::ProgressSnapshot;
use domjoin_core::registry::ScriptOverview;

use crate::dto::{CancelResponse, HealthResponse, RunScriptsRequest, StartRequest};
use crate::error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator every request is served by.
    pub orchestrator: JoinOrchestrator,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /join/status`
pub async fn status(State(state): State<AppState>) -> Result<Json<JoinStatus>, ApiError> {
    Ok(Json(state.orchestrator.status().await?))
}

/// `GET /join/scripts`
pub async fn scripts(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScriptOverview>>, ApiError> {
    Ok(Json(state.orchestrator.overview().await?))
}

/// `POST /join/start`
pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let Json(request) = payload?;
    info!(
        hostname = %request.hostname,
        username = %request.username,
        "Join requested"
    );

    let started = state
        .orchestrator
        .start(&request.hostname, &request.username, &request.password)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// `POST /join/run`
pub async fn run_scripts(
    State(state): State<AppState>,
    payload: Result<Json<RunScriptsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let Json(request) = payload?;

    let credentials = match (request.username, request.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "username and password must be given together".to_string(),
            ));
        }
    };
    info!(
        scripts = ?request.scripts,
        force = request.force,
        with_credentials = credentials.is_some(),
        "Script run requested"
    );

    let started = state
        .orchestrator
        .run_scripts(&request.scripts, request.force, credentials)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// `GET /join/progress/{run_id}`
pub async fn progress(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.progress(&run_id).await?))
}

/// `POST /join/runs/{run_id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.orchestrator.cancel(&run_id).await?;
    Ok(Json(CancelResponse { run_id, cancelled }))
}

/// `GET /join/logview`
pub async fn logview(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let log = state.orchestrator.logview().await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

/// `POST /join/unjoin`
pub async fn unjoin(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.orchestrator.unjoin().await?;
    Ok(StatusCode::NO_CONTENT)
}
