// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed join state store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

use super::{JoinStateStore, LeaseOutcome, PersistenceError, Result, RunLease, StoredRun};
use crate::run::{RunState, RunSummary};
use crate::script::{HostJoinStatus, JoinRecord, RecordStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(sqlx::FromRow)]
struct RecordRow {
    script_name: String,
    status: String,
    version: i64,
    last_run_at: DateTime<Utc>,
    last_result_message: String,
    attempts: i64,
}

impl TryFrom<RecordRow> for JoinRecord {
    type Error = PersistenceError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let corrupt = |reason: String| PersistenceError::Corrupt {
            key: row.script_name.clone(),
            reason,
        };
        let status = RecordStatus::from_str(&row.status).map_err(corrupt)?;
        let version = u32::try_from(row.version)
            .map_err(|_| corrupt(format!("invalid version {}", row.version)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| corrupt(format!("invalid attempt count {}", row.attempts)))?;

        Ok(JoinRecord {
            script_name: row.script_name,
            status,
            version,
            last_run_at: row.last_run_at,
            last_result_message: row.last_result_message,
            attempts,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HostRow {
    joined: bool,
    joined_at: Option<DateTime<Utc>>,
    domain_controller_host: String,
    last_full_run_errors: String,
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    run_id: String,
    owner: String,
    acquired_at_ms: i64,
    expires_at_ms: i64,
}

impl TryFrom<LeaseRow> for RunLease {
    type Error = PersistenceError;

    fn try_from(row: LeaseRow) -> Result<Self> {
        let to_time = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| PersistenceError::Corrupt {
                key: "run_lease".to_string(),
                reason: format!("timestamp out of range: {}", ms),
            })
        };
        Ok(RunLease {
            acquired_at: to_time(row.acquired_at_ms)?,
            expires_at: to_time(row.expires_at_ms)?,
            run_id: row.run_id,
            owner: row.owner,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    summary: String,
    log: String,
}

impl TryFrom<RunRow> for StoredRun {
    type Error = PersistenceError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(StoredRun {
            summary: serde_json::from_str(&row.summary)?,
            log: row.log,
        })
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed join state store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Wrap an existing pool. Migrations are not run; see [`Self::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL journaling with `synchronous=FULL`, so a returned write
    ///   survives a crash
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        debug!(path = %path.display(), "Join state store opened");
        Ok(store)
    }

    /// Apply embedded migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_lease(&self) -> Result<Option<RunLease>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT run_id, owner, acquired_at_ms, expires_at_ms
            FROM run_lease
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunLease::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl JoinStateStore for SqliteStateStore {
    async fn get(&self, script_name: &str) -> Result<Option<JoinRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT script_name, status, version, last_run_at, last_result_message, attempts
            FROM join_records
            WHERE script_name = ?
            "#,
        )
        .bind(script_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JoinRecord::try_from).transpose()
    }

    async fn list_records(&self) -> Result<Vec<JoinRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT script_name, status, version, last_run_at, last_result_message, attempts
            FROM join_records
            ORDER BY script_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JoinRecord::try_from).collect()
    }

    async fn put(&self, record: &JoinRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO join_records
                (script_name, status, version, last_run_at, last_result_message, attempts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (script_name) DO UPDATE SET
                status = excluded.status,
                version = excluded.version,
                last_run_at = excluded.last_run_at,
                last_result_message = excluded.last_result_message,
                attempts = excluded.attempts
            "#,
        )
        .bind(&record.script_name)
        .bind(record.status.as_str())
        .bind(i64::from(record.version))
        .bind(record.last_run_at)
        .bind(&record.last_result_message)
        .bind(i64::from(record.attempts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_host_status(&self) -> Result<HostJoinStatus> {
        let row = sqlx::query_as::<_, HostRow>(
            r#"
            SELECT joined, joined_at, domain_controller_host, last_full_run_errors
            FROM host_status
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(HostJoinStatus {
                joined: row.joined,
                joined_at: row.joined_at,
                domain_controller_host: row.domain_controller_host,
                last_full_run_errors: serde_json::from_str(&row.last_full_run_errors)?,
            }),
            None => Ok(HostJoinStatus::default()),
        }
    }

    async fn set_host_status(&self, status: &HostJoinStatus) -> Result<()> {
        let errors = serde_json::to_string(&status.last_full_run_errors)?;

        sqlx::query(
            r#"
            INSERT INTO host_status
                (id, joined, joined_at, domain_controller_host, last_full_run_errors)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT (id) DO UPDATE SET
                joined = excluded.joined,
                joined_at = excluded.joined_at,
                domain_controller_host = excluded.domain_controller_host,
                last_full_run_errors = excluded.last_full_run_errors
            "#,
        )
        .bind(status.joined)
        .bind(status.joined_at)
        .bind(&status.domain_controller_host)
        .bind(errors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_join_state(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM join_records")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM host_status")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LeaseOutcome> {
        // The row may be released between a refused upsert and the read-back;
        // one retry covers that window.
        for _ in 0..2 {
            let now_ms = Utc::now().timestamp_millis();
            let expires_ms = now_ms.saturating_add(ttl_millis(ttl));

            let result = sqlx::query(
                r#"
                INSERT INTO run_lease (id, run_id, owner, acquired_at_ms, expires_at_ms)
                VALUES (1, ?1, ?2, ?3, ?4)
                ON CONFLICT (id) DO UPDATE SET
                    run_id = excluded.run_id,
                    owner = excluded.owner,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms
                WHERE run_lease.expires_at_ms <= ?3
                "#,
            )
            .bind(run_id)
            .bind(owner)
            .bind(now_ms)
            .bind(expires_ms)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(LeaseOutcome::Acquired);
            }

            if let Some(lease) = self.read_lease().await? {
                return Ok(LeaseOutcome::Held(lease));
            }
        }

        Err(PersistenceError::Corrupt {
            key: "run_lease".to_string(),
            reason: "lease neither acquirable nor held".to_string(),
        })
    }

    async fn renew_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let expires_ms = Utc::now()
            .timestamp_millis()
            .saturating_add(ttl_millis(ttl));

        let result = sqlx::query(
            r#"
            UPDATE run_lease
            SET expires_at_ms = ?1
            WHERE id = 1 AND run_id = ?2 AND owner = ?3
            "#,
        )
        .bind(expires_ms)
        .bind(run_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM run_lease
            WHERE id = 1 AND run_id = ?1 AND owner = ?2
            "#,
        )
        .bind(run_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn current_lease(&self) -> Result<Option<RunLease>> {
        let now = Utc::now();
        Ok(self.read_lease().await?.filter(|lease| lease.expires_at > now))
    }

    async fn save_run(&self, summary: &RunSummary, log: &str) -> Result<()> {
        let encoded = serde_json::to_string(summary)?;

        sqlx::query(
            r#"
            INSERT INTO join_runs
                (run_id, kind, state, started_at_ms, finished_at_ms, summary, log)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (run_id) DO UPDATE SET
                state = excluded.state,
                finished_at_ms = excluded.finished_at_ms,
                summary = excluded.summary,
                log = excluded.log
            "#,
        )
        .bind(&summary.run_id)
        .bind(summary.kind.as_str())
        .bind(summary.state.as_str())
        .bind(summary.started_at.timestamp_millis())
        .bind(summary.finished_at.map(|t| t.timestamp_millis()))
        .bind(encoded)
        .bind(log)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT summary, log
            FROM join_runs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRun::try_from).transpose()
    }

    async fn latest_run(&self) -> Result<Option<StoredRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT summary, log
            FROM join_runs
            ORDER BY started_at_ms DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRun::try_from).transpose()
    }

    async fn list_runs_in_state(&self, state: RunState) -> Result<Vec<StoredRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT summary, log
            FROM join_runs
            WHERE state = ?
            ORDER BY started_at_ms
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredRun::try_from).collect()
    }

    async fn prune_runs(&self, keep: usize) -> Result<u64> {
        let keep = i64::try_from(keep.max(1)).unwrap_or(i64::MAX);

        let result = sqlx::query(
            r#"
            DELETE FROM join_runs
            WHERE state <> 'running'
              AND run_id NOT IN (
                SELECT run_id
                FROM join_runs
                ORDER BY started_at_ms DESC, rowid DESC
                LIMIT ?
              )
            "#,
        )
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
