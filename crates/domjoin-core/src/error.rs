// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-facing error type for orchestrator operations.
//!
//! Only pre-flight failures surface as [`JoinError`]. Everything that goes
//! wrong while scripts execute is captured in the run summary instead.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::registry::RegistryError;
use crate::store::PersistenceError;

/// Errors returned synchronously by orchestrator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JoinError {
    /// Another run holds the lease; attach to its progress instead.
    #[error("A join run is already in progress: {run_id}")]
    AlreadyRunning {
        /// Run currently holding the lease.
        run_id: String,
    },

    /// An unjoin holds the lease. It has no run to attach to.
    #[error("An unjoin is in progress")]
    UnjoinInProgress,

    /// Credentials were missing or rejected.
    #[error("Credentials rejected: {0}")]
    CredentialRejected(String),

    /// The external authentication collaborator failed.
    #[error("Credential check failed: {0}")]
    Authenticator(String),

    /// The request was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No run with this id is known.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// The script registry could not be read.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The state store failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl JoinError {
    /// Stable code for this error, used by the HTTP layer and CLI.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::UnjoinInProgress => "UNJOIN_IN_PROGRESS",
            Self::CredentialRejected(_) => "CREDENTIAL_REJECTED",
            Self::Authenticator(_) => "AUTHENTICATOR_UNAVAILABLE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::Registry(_) => "REGISTRY_UNAVAILABLE",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// Whether retrying with the same input cannot succeed.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CredentialRejected(_))
    }
}

impl From<CredentialError> for JoinError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Checker(reason) => Self::Authenticator(reason),
            other => Self::CredentialRejected(other.to_string()),
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, JoinError>;
