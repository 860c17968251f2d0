// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default directory scanned for join scripts.
pub const DEFAULT_SCRIPTS_DIR: &str = "/usr/lib/domjoin/scripts";

/// Default location of the join state database.
pub const DEFAULT_STATE_PATH: &str = ".data/domjoin.db";

/// Finished runs kept in the run history by default.
pub const DEFAULT_RUN_RETENTION: usize = 50;

/// Exit code a join script uses to report "already satisfied, nothing to do".
pub const DEFAULT_SKIP_EXIT_CODE: i32 = 77;

/// Domjoin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the installed join scripts.
    pub scripts_dir: PathBuf,
    /// SQLite file holding join records, host status, run lease and run history.
    pub state_path: PathBuf,
    /// Role tag of this host (e.g. `memberserver`, `domaincontroller_backup`).
    pub host_role: String,
    /// Hard wall-clock timeout per script.
    pub script_timeout: Duration,
    /// Maximum captured output per script before truncation.
    pub output_limit_bytes: usize,
    /// Exit code meaning "already satisfied".
    pub skip_exit_code: i32,
    /// Time-to-live of the run lease. Renewed every third of this while a run is active.
    pub lease_ttl: Duration,
    /// Optional external credential checker (`program [args...]`).
    pub auth_command: Option<Vec<String>>,
    /// Number of most recent runs kept in the run history. Older finished
    /// runs are pruned by the background sweeper.
    pub run_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            host_role: "memberserver".to_string(),
            script_timeout: Duration::from_secs(300),
            output_limit_bytes: 64 * 1024,
            skip_exit_code: DEFAULT_SKIP_EXIT_CODE,
            lease_ttl: Duration::from_secs(90),
            auth_command: None,
            run_retention: DEFAULT_RUN_RETENTION,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DOMJOIN_SCRIPTS_DIR`: join script directory (default: `/usr/lib/domjoin/scripts`)
    /// - `DOMJOIN_STATE_PATH`: SQLite state file (default: `.data/domjoin.db`)
    /// - `DOMJOIN_HOST_ROLE`: host role tag (default: `memberserver`)
    /// - `DOMJOIN_SCRIPT_TIMEOUT_SECS`: per-script timeout (default: 300)
    /// - `DOMJOIN_OUTPUT_LIMIT_BYTES`: captured output bound (default: 65536)
    /// - `DOMJOIN_SKIP_EXIT_CODE`: "already satisfied" exit code (default: 77)
    /// - `DOMJOIN_LEASE_TTL_SECS`: run lease TTL (default: 90)
    /// - `DOMJOIN_AUTH_COMMAND`: external credential checker (default: unset)
    /// - `DOMJOIN_RUN_RETENTION`: runs kept in the run history (default: 50)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let scripts_dir = std::env::var("DOMJOIN_SCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.scripts_dir);

        let state_path = std::env::var("DOMJOIN_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_path);

        let host_role = std::env::var("DOMJOIN_HOST_ROLE").unwrap_or(defaults.host_role);
        if host_role.trim().is_empty() {
            return Err(ConfigError::Invalid("DOMJOIN_HOST_ROLE", "must not be empty"));
        }

        let timeout_secs: u64 = parse_var("DOMJOIN_SCRIPT_TIMEOUT_SECS", 300)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "DOMJOIN_SCRIPT_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }

        let output_limit_bytes: usize =
            parse_var("DOMJOIN_OUTPUT_LIMIT_BYTES", defaults.output_limit_bytes)?;

        let skip_exit_code: i32 = parse_var("DOMJOIN_SKIP_EXIT_CODE", DEFAULT_SKIP_EXIT_CODE)?;
        if skip_exit_code == 0 {
            return Err(ConfigError::Invalid(
                "DOMJOIN_SKIP_EXIT_CODE",
                "must differ from the success exit code",
            ));
        }

        let lease_secs: u64 = parse_var("DOMJOIN_LEASE_TTL_SECS", 90)?;
        if lease_secs < 3 {
            return Err(ConfigError::Invalid(
                "DOMJOIN_LEASE_TTL_SECS",
                "must be at least 3 seconds",
            ));
        }

        let auth_command = std::env::var("DOMJOIN_AUTH_COMMAND")
            .ok()
            .map(|cmd| {
                cmd.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|parts| !parts.is_empty());

        let run_retention: usize = parse_var("DOMJOIN_RUN_RETENTION", DEFAULT_RUN_RETENTION)?;
        if run_retention == 0 {
            return Err(ConfigError::Invalid(
                "DOMJOIN_RUN_RETENTION",
                "must keep at least one run",
            ));
        }

        Ok(Self {
            scripts_dir,
            state_path,
            host_role: host_role.trim().to_string(),
            script_timeout: Duration::from_secs(timeout_secs),
            output_limit_bytes,
            skip_exit_code,
            lease_ttl: Duration::from_secs(lease_secs),
            auth_command,
            run_retention,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a valid number")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
