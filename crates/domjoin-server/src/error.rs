// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API error type and error response payloads.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use domjoin_core::error::JoinError;

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Run holding the lease (`ALREADY_RUNNING` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Retrying with the same input cannot succeed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub critical: bool,
}

/// Errors returned by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Orchestrator rejected the request.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// The request body could not be parsed.
    #[error("{0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn to_status_and_payload(&self) -> (StatusCode, ErrorResponse) {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    code: "INVALID_REQUEST".to_string(),
                    message: message.clone(),
                    run_id: None,
                    critical: false,
                },
            ),
            Self::Join(err) => {
                let status = match err {
                    JoinError::AlreadyRunning { .. } | JoinError::UnjoinInProgress => {
                        StatusCode::CONFLICT
                    }
                    JoinError::CredentialRejected(_) => StatusCode::UNAUTHORIZED,
                    JoinError::Authenticator(_) => StatusCode::SERVICE_UNAVAILABLE,
                    JoinError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    JoinError::RunNotFound(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let run_id = match err {
                    JoinError::AlreadyRunning { run_id } => Some(run_id.clone()),
                    _ => None,
                };
                (
                    status,
                    ErrorResponse {
                        code: err.error_code().to_string(),
                        message: err.to_string(),
                        run_id,
                        critical: err.is_critical(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = self.to_status_and_payload();
        if status.is_server_error() {
            tracing::error!(code = %payload.code, error = %payload.message, "Request failed");
        }
        (status, Json(payload)).into_response()
    }
}
