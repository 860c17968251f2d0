// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Join script discovery.
//!
//! Scripts are executable files in a single directory, named `NN<name>[.inst]`
//! where the numeric prefix is the default weight. Metadata is declared in
//! header comments within the first 4 KiB:
//!
//! ```text
//! #!/bin/sh
//! # domjoin: class=run-once
//! # domjoin: roles=memberserver,domaincontroller_backup
//! # domjoin: version=2
//! # domjoin: domain-bind
//! ```
//!
//! The directory is re-scanned on every call; nothing is cached.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::script::{IdempotencyClass, JoinRecord, JoinScript, RecordStatus};
use crate::store::{JoinStateStore, PersistenceError};

/// How much of each file is searched for header lines.
const HEADER_SCAN_BYTES: u64 = 4096;

/// Weight for files without a numeric prefix.
const DEFAULT_WEIGHT: i32 = 50;

const HEADER_PREFIX: &str = "domjoin:";

/// Errors from script discovery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The script directory could not be listed.
    #[error("script directory {path} is unavailable: {source}")]
    Unavailable {
        /// Directory that was scanned.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A script file could not be inspected.
    #[error("script {path} is unreadable: {source}")]
    Unreadable {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Join records could not be read while computing due scripts.
    #[error("join state unavailable: {0}")]
    State(#[from] PersistenceError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// One row of the script status grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOverview {
    /// Script name.
    pub name: String,
    /// Execution order.
    pub weight: i32,
    /// Re-execution policy.
    pub idempotency_class: IdempotencyClass,
    /// Declared script version.
    pub version: u32,
    /// Whether the script performs the domain bind.
    pub domain_bind: bool,
    /// Optional description from the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `pending` when never run, otherwise the recorded status.
    pub status: String,
    /// Latest record, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<JoinRecord>,
    /// Whether a normal (unforced) run would execute it.
    pub due: bool,
}

/// Discovers join scripts in a directory.
#[derive(Debug, Clone)]
pub struct ScriptRegistry {
    dir: PathBuf,
}

impl ScriptRegistry {
    /// Create a registry over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All scripts, sorted by weight then name. Duplicate names keep the
    /// first occurrence in that order.
    pub async fn list_scripts(&self) -> Result<Vec<JoinScript>> {
        let unavailable = |source| RegistryError::Unavailable {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        let mut scripts = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %path.display(), "Ignoring non UTF-8 file name");
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                // Dangling symlink
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Ignoring dangling entry");
                    continue;
                }
                Err(source) => return Err(RegistryError::Unreadable { path, source }),
            };
            if !metadata.is_file() {
                debug!(path = %path.display(), "Ignoring non-file entry");
                continue;
            }
            if metadata.permissions().mode() & 0o111 == 0 {
                debug!(path = %path.display(), "Ignoring non-executable file");
                continue;
            }

            let header = read_header(&path)
                .await
                .map_err(|source| RegistryError::Unreadable {
                    path: path.clone(),
                    source,
                })?;

            match parse_script(&path, &file_name, &header) {
                Some(script) => scripts.push(script),
                None => debug!(path = %path.display(), "Ignoring file without a script name"),
            }
        }

        scripts.sort_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut seen = HashSet::new();
        scripts.retain(|script| {
            if seen.insert(script.name.clone()) {
                true
            } else {
                warn!(
                    script = %script.name,
                    path = %script.path.display(),
                    "Duplicate join script name, ignoring"
                );
                false
            }
        });

        Ok(scripts)
    }

    /// Scripts applicable to `host_role` that a run with `force` should execute.
    pub async fn list_due(
        &self,
        host_role: &str,
        store: &dyn JoinStateStore,
        force: bool,
    ) -> Result<Vec<JoinScript>> {
        let scripts = self.list_scripts().await?;
        let mut records = HashMap::new();
        for script in scripts.iter().filter(|s| s.applies_to(host_role)) {
            if let Some(record) = store.get(&script.name).await? {
                records.insert(script.name.clone(), record);
            }
        }
        Ok(due_scripts(&scripts, host_role, &records, force)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Status grid of every script applicable to `host_role`.
    pub async fn overview(
        &self,
        host_role: &str,
        store: &dyn JoinStateStore,
    ) -> Result<Vec<ScriptOverview>> {
        let scripts = self.list_scripts().await?;
        let mut rows = Vec::new();

        for script in scripts.into_iter().filter(|s| s.applies_to(host_role)) {
            let record = store.get(&script.name).await?;
            rows.push(ScriptOverview {
                due: is_due(&script, record.as_ref(), false),
                status: record
                    .as_ref()
                    .map(|r| r.status.as_str().to_string())
                    .unwrap_or_else(|| "pending".to_string()),
                name: script.name,
                weight: script.weight,
                idempotency_class: script.idempotency_class,
                version: script.version,
                domain_bind: script.domain_bind,
                description: script.description,
                record,
            });
        }

        Ok(rows)
    }
}

/// Filter an ordered script list down to the ones due on `host_role`, given
/// the latest record of each script keyed by name.
pub fn due_scripts<'a>(
    scripts: &'a [JoinScript],
    host_role: &str,
    records: &HashMap<String, JoinRecord>,
    force: bool,
) -> Vec<&'a JoinScript> {
    scripts
        .iter()
        .filter(|s| s.applies_to(host_role))
        .filter(|s| is_due(s, records.get(&s.name), force))
        .collect()
}

/// Whether `script` should execute given its latest record.
///
/// - `RequiresForce` runs only when forced.
/// - Any other class runs when forced.
/// - `SafeRerun` always runs.
/// - `RunOnce` runs when never attempted, after a failure, or when the
///   installed version is newer than the recorded one.
pub fn is_due(script: &JoinScript, record: Option<&JoinRecord>, force: bool) -> bool {
    match script.idempotency_class {
        IdempotencyClass::RequiresForce => force,
        _ if force => true,
        IdempotencyClass::SafeRerun => true,
        IdempotencyClass::RunOnce => match record {
            None => true,
            Some(r) if r.status == RecordStatus::Failed => true,
            Some(r) => r.version < script.version,
        },
    }
}

async fn read_header(path: &Path) -> std::io::Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    file.take(HEADER_SCAN_BYTES).read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Build a [`JoinScript`] from its file name and header text.
///
/// Returns `None` when the file name yields no script name.
pub fn parse_script(path: &Path, file_name: &str, header: &str) -> Option<JoinScript> {
    let digits_end = file_name
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(file_name.len());
    let (prefix, rest) = file_name.split_at(digits_end);
    let name = rest.strip_suffix(".inst").unwrap_or(rest);
    if name.is_empty() {
        return None;
    }

    let mut script = JoinScript {
        name: name.to_string(),
        path: path.to_path_buf(),
        applicable_roles: Default::default(),
        weight: prefix.parse().unwrap_or(DEFAULT_WEIGHT),
        idempotency_class: IdempotencyClass::RunOnce,
        version: 1,
        domain_bind: false,
        description: None,
    };

    for line in header.lines() {
        let Some(directive) = line
            .trim()
            .strip_prefix('#')
            .map(str::trim_start)
            .and_then(|l| l.strip_prefix(HEADER_PREFIX))
            .map(str::trim)
        else {
            continue;
        };
        apply_directive(&mut script, directive);
    }

    Some(script)
}

fn apply_directive(script: &mut JoinScript, directive: &str) {
    let Some((key, value)) = directive.split_once('=') else {
        match directive.to_ascii_lowercase().as_str() {
            "domain-bind" | "domain_bind" => script.domain_bind = true,
            other => warn!(script = %script.name, directive = other, "Unknown header flag"),
        }
        return;
    };

    let value = value.trim();
    match key.trim().to_ascii_lowercase().as_str() {
        "roles" => {
            script.applicable_roles = value
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        "weight" => match value.parse() {
            Ok(weight) => script.weight = weight,
            Err(_) => warn!(script = %script.name, value, "Invalid weight in header"),
        },
        "class" => match value.parse() {
            Ok(class) => script.idempotency_class = class,
            Err(e) => warn!(script = %script.name, error = %e, "Invalid class in header"),
        },
        "version" => match value.parse::<u32>() {
            Ok(version) if version > 0 => script.version = version,
            _ => warn!(script = %script.name, value, "Invalid version in header"),
        },
        "description" => {
            if !value.is_empty() {
                script.description = Some(value.to_string());
            }
        }
        "domain-bind" | "domain_bind" => {
            script.domain_bind = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        other => warn!(script = %script.name, key = other, "Unknown header key"),
    }
}
