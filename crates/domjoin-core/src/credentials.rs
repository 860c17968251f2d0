// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential handling for privileged join scripts.
//!
//! Credentials live only for the duration of one run. The password is held
//! in a [`SecretString`] and reaches scripts exclusively through a `0600`
//! temporary file; it never appears in argv, the environment, logs or
//! error messages.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::script::JoinScript;

/// Default timeout for an external credential check.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Credential failures. Messages never contain secret material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The script needs credentials but the run has none.
    #[error("credentials required but not supplied")]
    Missing,

    /// The authentication collaborator rejected the credentials.
    #[error("{0}")]
    Rejected(String),

    /// The authentication collaborator could not give a verdict.
    #[error("credential check failed: {0}")]
    Checker(String),
}

/// Username and password supplied by the caller for one run.
#[derive(Debug)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Wrap a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The account name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password. Callers must not log or persist it.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// Validates credentials against the domain.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Check `credentials`, optionally against a specific domain controller.
    async fn authenticate(
        &self,
        credentials: &Credentials,
        dc_host: Option<&str>,
    ) -> Result<(), CredentialError>;
}

/// Accepts any well-formed credentials; the scripts perform the real bind.
#[derive(Debug, Clone, Default)]
pub struct StructuralAuthenticator;

#[async_trait]
impl Authenticator for StructuralAuthenticator {
    fn name(&self) -> &'static str {
        "structural"
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        _dc_host: Option<&str>,
    ) -> Result<(), CredentialError> {
        let username = credentials.username();
        if username.trim().is_empty() || credentials.expose_password().is_empty() {
            return Err(CredentialError::Rejected(
                "username and password are required".to_string(),
            ));
        }
        if username.chars().any(|c| c.is_control()) {
            return Err(CredentialError::Rejected(
                "username contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs an external checker: `program [args...] <username>`, password on stdin.
///
/// Exit status 0 accepts the credentials, any other exit status rejects them.
/// `DOMJOIN_DC_HOST` is set when a domain controller is known.
#[derive(Debug, Clone)]
pub struct CommandAuthenticator {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandAuthenticator {
    /// Create a checker from a program and its leading arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    /// Override the check timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Authenticator for CommandAuthenticator {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        dc_host: Option<&str>,
    ) -> Result<(), CredentialError> {
        StructuralAuthenticator
            .authenticate(credentials, dc_host)
            .await?;

        let Some((program, args)) = self.command.split_first() else {
            return Err(CredentialError::Checker(
                "no checker command configured".to_string(),
            ));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .arg(credentials.username())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(host) = dc_host {
            cmd.env("DOMJOIN_DC_HOST", host);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CredentialError::Checker(format!("failed to start {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let secret = format!("{}\n", credentials.expose_password());
            // The checker may exit before reading; its exit status decides.
            if let Err(e) = stdin.write_all(secret.as_bytes()).await {
                debug!(error = %e, "Credential checker closed stdin early");
            }
            drop(stdin);
        }

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(CredentialError::Checker(format!(
                    "failed to wait for {}: {}",
                    program, e
                )));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(CredentialError::Checker(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(_) => Err(CredentialError::Rejected(
                "invalid username or password".to_string(),
            )),
            None => Err(CredentialError::Checker(
                "checker terminated by signal".to_string(),
            )),
        }
    }
}

/// Credentials that passed validation for the current run.
#[derive(Debug, Clone)]
pub struct ValidatedCredentials {
    inner: Arc<Credentials>,
}

impl ValidatedCredentials {
    /// The account name.
    pub fn username(&self) -> &str {
        self.inner.username()
    }

    /// Write the password to a fresh `0600` temporary file.
    ///
    /// The file is removed when the returned handle is dropped.
    pub fn write_password_file(&self) -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("domjoin-bind-")
            .tempfile()?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(self.inner.expose_password().as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// Decides per script whether credentials are needed, and validates them at
/// most once per run.
pub struct CredentialGate {
    credentials: Option<Arc<Credentials>>,
    dc_host: Option<String>,
    authenticator: Arc<dyn Authenticator>,
    verdict: Mutex<Option<Result<(), CredentialError>>>,
}

impl CredentialGate {
    /// Create a gate for one run.
    pub fn new(
        credentials: Option<Credentials>,
        dc_host: Option<String>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            credentials: credentials.map(Arc::new),
            dc_host,
            authenticator,
            verdict: Mutex::new(None),
        }
    }

    /// Whether the run carries credentials.
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Validate the run's credentials. The verdict is cached; checker failures
    /// are not, so a later script retries the check.
    pub async fn validate(&self) -> Result<ValidatedCredentials, CredentialError> {
        let credentials = self.credentials.clone().ok_or(CredentialError::Missing)?;

        let mut verdict = self.verdict.lock().await;
        if let Some(cached) = verdict.as_ref() {
            return cached
                .clone()
                .map(|()| ValidatedCredentials { inner: credentials });
        }

        let result = self
            .authenticator
            .authenticate(&credentials, self.dc_host.as_deref())
            .await;
        match &result {
            Ok(()) => debug!(
                authenticator = self.authenticator.name(),
                username = credentials.username(),
                "Credentials accepted"
            ),
            Err(e) => warn!(
                authenticator = self.authenticator.name(),
                username = credentials.username(),
                error = %e,
                "Credentials not accepted"
            ),
        }
        if !matches!(result, Err(CredentialError::Checker(_))) {
            *verdict = Some(result.clone());
        }

        result.map(|()| ValidatedCredentials { inner: credentials })
    }

    /// Credentials for `script` if it needs them, or `None` if it does not.
    pub async fn require_if_needed(
        &self,
        script: &JoinScript,
    ) -> Result<Option<ValidatedCredentials>, CredentialError> {
        if !script.requires_credentials() {
            return Ok(None);
        }
        self.validate().await.map(Some)
    }
}
