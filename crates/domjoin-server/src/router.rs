// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router setup.

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use domjoin_core::orchestrator::JoinOrchestrator;

use crate::handlers::{self, AppState};

/// Create the domjoin HTTP router.
pub fn router(orchestrator: JoinOrchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/join/status", get(handlers::status))
        .route("/join/scripts", get(handlers::scripts))
        .route("/join/start", post(handlers::start))
        .route("/join/run", post(handlers::run_scripts))
        .route("/join/progress/{run_id}", get(handlers::progress))
        .route("/join/runs/{run_id}/cancel", post(handlers::cancel))
        .route("/join/logview", get(handlers::logview))
        .route("/join/unjoin", post(handlers::unjoin))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { orchestrator })
}
