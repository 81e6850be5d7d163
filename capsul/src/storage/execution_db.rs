//! The `ExecutionDatabase`: persists one execution record and its
//! compiled workflow (spec.md §4.6).
//!
//! `claim`/`complete` are made serializable with respect to concurrent
//! workers the same way the teacher's storage layer does: a single
//! writer connection pool, so every mutating query is naturally
//! serialized by sqlite's own locking.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

use capsul_sdk::controller::FieldValue;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::compiler::{Job, JobStatus, ParameterStore, Workflow};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("timed out waiting for execution {0} to finish")]
    WaitTimeout(String),

    #[error("unexpected storage error occurred; code: {code:?}; message: {message}")]
    GenericDBError { code: Option<String>, message: String },
}

fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => StorageError::Exists,
                    _ => StorageError::GenericDBError {
                        code: Some(err_code.to_string()),
                        message: database_err.to_string(),
                    },
                }
            } else {
                StorageError::GenericDBError {
                    code: None,
                    message: database_err.to_string(),
                }
            }
        }
        _ => StorageError::GenericDBError {
            code: None,
            message: e.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ready,
    Submitted,
    Running,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub engine_id: String,
    pub status: ExecutionStatus,
    pub start_time: i64,
    pub workflow: Workflow,
    pub store: ParameterStore,
}

/// Per-job status plus timing and stdout/stderr pointers, aggregated
/// into a per-execution view (spec.md §4.6 `execution_report`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub uuid: Uuid,
    pub status: JobStatus,
    pub started: Option<i64>,
    pub ended: Option<i64>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: String,
    pub status: ExecutionStatus,
    pub jobs: Vec<JobReport>,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Persisted execution/job/parameter state, backed by a single-writer
/// sqlite pool.
#[derive(Debug, Clone)]
pub struct ExecutionDatabase {
    pool: SqlitePool,
}

impl ExecutionDatabase {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        if path != ":memory:" && !Path::new(path).exists() {
            std::fs::File::create(path).map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    engine_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    workflow TEXT NOT NULL,
    store TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS jobs (
    execution_id TEXT NOT NULL,
    uuid TEXT NOT NULL,
    status TEXT NOT NULL,
    started INTEGER,
    ended INTEGER,
    outputs TEXT,
    PRIMARY KEY (execution_id, uuid)
);
"#,
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(ExecutionDatabase { pool })
    }

    /// Atomically creates an execution record in state `ready`, persisting
    /// the compiled workflow's `ParameterStore` alongside it so later
    /// `complete` calls can write worker outputs where `claim` will see
    /// them (spec.md §4.6 `new_execution`).
    pub async fn new_execution(
        &self,
        engine_id: &str,
        workflow: Workflow,
        store: ParameterStore,
    ) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let workflow_json = serde_json::to_string(&workflow).expect("workflow serializes");
        let store_json = serde_json::to_string(&store).expect("store serializes");
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("INSERT INTO executions (id, engine_id, status, start_time, workflow, store) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&id)
            .bind(engine_id)
            .bind(ExecutionStatus::Ready.to_string())
            .bind(now_ms())
            .bind(&workflow_json)
            .bind(&store_json)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        for job in &workflow.jobs {
            sqlx::query("INSERT INTO jobs (execution_id, uuid, status) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(job.uuid.to_string())
                .bind(job.status.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(id)
    }

    /// Returns one job whose `wait_for` set is fully `done`, marking it
    /// `submitted`. Serializable: a single writer connection means two
    /// concurrent claims never race on the same row. A job's `command` is
    /// rebuilt against the current parameter store before it is returned,
    /// so a linked input proxied onto an upstream job's output reflects
    /// that job's actual, worker-written value rather than its
    /// compile-time snapshot (spec.md §5 happens-before guarantee).
    pub async fn claim(&self, execution_id: &str) -> Result<Option<Job>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let execution_row = sqlx::query("SELECT status, workflow, store FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;
        let status: ExecutionStatus = execution_row.get::<String, _>("status").parse().expect("stored status is valid");
        // `stop` transitions a still-running execution straight to
        // `failed`; once terminal, no further job may be claimed
        // (spec.md §5 Cancellation "prevents future claims").
        if matches!(status, ExecutionStatus::Ended | ExecutionStatus::Failed) {
            tx.commit().await.map_err(map_sqlx_error)?;
            return Ok(None);
        }
        let workflow: Workflow =
            serde_json::from_str(execution_row.get::<String, _>("workflow").as_str()).expect("stored workflow is valid");
        let store: ParameterStore =
            serde_json::from_str(execution_row.get::<String, _>("store").as_str()).expect("stored parameter store is valid");

        let done: Vec<String> = sqlx::query("SELECT uuid FROM jobs WHERE execution_id = ? AND status = ?")
            .bind(execution_id)
            .bind(JobStatus::Done.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(|r| r.get::<String, _>("uuid"))
            .collect();
        let done: std::collections::HashSet<Uuid> =
            done.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect();

        let ready: Vec<String> = sqlx::query("SELECT uuid FROM jobs WHERE execution_id = ? AND status = ?")
            .bind(execution_id)
            .bind(JobStatus::Ready.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(|r| r.get::<String, _>("uuid"))
            .collect();

        for job in &workflow.jobs {
            if !ready.iter().any(|r| r == &job.uuid.to_string()) {
                continue;
            }
            if job.wait_for.iter().all(|w| done.contains(w)) {
                sqlx::query("UPDATE jobs SET status = ?, started = ? WHERE execution_id = ? AND uuid = ?")
                    .bind(JobStatus::Submitted.to_string())
                    .bind(now_ms())
                    .bind(execution_id)
                    .bind(job.uuid.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                if status == ExecutionStatus::Ready {
                    sqlx::query("UPDATE executions SET status = ? WHERE id = ?")
                        .bind(ExecutionStatus::Running.to_string())
                        .bind(execution_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                }
                tx.commit().await.map_err(map_sqlx_error)?;

                let mut job = job.clone();
                if let Some(definition_id) = &job.definition_id {
                    let params = store.resolve_node(&job.node_path);
                    if let Some(command) = capsul_sdk::registry::resolve_process(definition_id).and_then(|def| def.command(&params)) {
                        job.command = command;
                    }
                    job.resolved_parameters = params;
                }
                return Ok(Some(job));
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(None)
    }

    /// Stores a finished job's outputs into the parameter store at its
    /// own node path (so any proxy onto that path now resolves to the
    /// written value) and marks it `done` or `failed`. On failure,
    /// cascades `cancelled` onto every job that can now never become
    /// ready, and fails the execution (spec.md §4.6 `complete`, §7.4).
    pub async fn complete(
        &self,
        execution_id: &str,
        job_uuid: Uuid,
        node_path: &str,
        outputs: HashMap<String, FieldValue>,
        succeeded: bool,
    ) -> Result<(), StorageError> {
        let status = if succeeded { JobStatus::Done } else { JobStatus::Failed };

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let execution_row = sqlx::query("SELECT store FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;
        let mut store: ParameterStore =
            serde_json::from_str(execution_row.get::<String, _>("store").as_str()).expect("stored parameter store is valid");
        for (field, value) in outputs {
            store.set(&format!("{node_path}.{field}"), value);
        }
        let store_json = serde_json::to_string(&store).expect("store serializes");
        sqlx::query("UPDATE executions SET store = ? WHERE id = ?")
            .bind(&store_json)
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let outputs_json = serde_json::to_string(&Vec::<()>::new()).expect("empty outputs marker serializes");
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, ended = ?, outputs = ? WHERE execution_id = ? AND uuid = ?",
        )
        .bind(status.to_string())
        .bind(now_ms())
        .bind(outputs_json)
        .bind(execution_id)
        .bind(job_uuid.to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        self.maybe_finish_execution(execution_id).await
    }

    /// Cascades `cancelled` onto every `ready` job whose `wait_for` set
    /// transitively includes a failed or cancelled job, then finalizes
    /// the execution as `done`/`failed` once every job has reached a
    /// terminal status (spec.md §7.4 "dependent jobs ... cancelled
    /// implicitly").
    async fn maybe_finish_execution(&self, execution_id: &str) -> Result<(), StorageError> {
        let execution_row = sqlx::query("SELECT workflow FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;
        let workflow: Workflow =
            serde_json::from_str(execution_row.get::<String, _>("workflow").as_str()).expect("stored workflow is valid");

        let rows = sqlx::query("SELECT uuid, status FROM jobs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let mut statuses: HashMap<Uuid, JobStatus> = rows
            .iter()
            .map(|r| {
                let uuid = Uuid::parse_str(&r.get::<String, _>("uuid")).expect("stored uuid is valid");
                let status = r.get::<String, _>("status").parse().expect("stored status is valid");
                (uuid, status)
            })
            .collect();

        let mut newly_cancelled = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            for job in &workflow.jobs {
                if statuses.get(&job.uuid) != Some(&JobStatus::Ready) {
                    continue;
                }
                let blocked = job
                    .wait_for
                    .iter()
                    .any(|w| matches!(statuses.get(w), Some(JobStatus::Failed) | Some(JobStatus::Cancelled)));
                if blocked {
                    statuses.insert(job.uuid, JobStatus::Cancelled);
                    newly_cancelled.push(job.uuid);
                    changed = true;
                }
            }
        }

        for uuid in &newly_cancelled {
            sqlx::query("UPDATE jobs SET status = ? WHERE execution_id = ? AND uuid = ?")
                .bind(JobStatus::Cancelled.to_string())
                .bind(execution_id)
                .bind(uuid.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        let any_failed = statuses.values().any(|s| *s == JobStatus::Failed);
        let all_terminal = statuses
            .values()
            .all(|s| matches!(s, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled));

        if !all_terminal {
            return Ok(());
        }

        let new_status = if any_failed { ExecutionStatus::Failed } else { ExecutionStatus::Ended };
        sqlx::query("UPDATE executions SET status = ? WHERE id = ?")
            .bind(new_status.to_string())
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Cancels an execution (spec.md §5 Cancellation): transitions it to
    /// `failed` immediately, which prevents `claim` from returning any
    /// further job, and marks every `ready` job `cancelled`. When
    /// `kill_running` is set, already-`submitted` jobs are marked
    /// `cancelled` too rather than left to finish — cooperative in that
    /// nothing here actually signals the OS subprocess; the worker loop
    /// observes the execution's terminal status on its next `claim` and
    /// stops.
    pub async fn stop(&self, execution_id: &str, kill_running: bool) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("UPDATE executions SET status = ? WHERE id = ?")
            .bind(ExecutionStatus::Failed.to_string())
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut cancel_from = vec![JobStatus::Ready];
        if kill_running {
            cancel_from.push(JobStatus::Submitted);
        }
        for from_status in cancel_from {
            sqlx::query("UPDATE jobs SET status = ? WHERE execution_id = ? AND status = ?")
                .bind(JobStatus::Cancelled.to_string())
                .bind(execution_id)
                .bind(from_status.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStatus, StorageError> {
        let row = sqlx::query("SELECT status FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;
        row.get::<String, _>("status")
            .parse()
            .map_err(|_| StorageError::GenericDBError { code: None, message: "corrupt status column".into() })
    }

    /// Blocking wait (bounded polling) for an execution to reach a
    /// terminal status.
    pub async fn wait(&self, execution_id: &str, timeout: Duration) -> Result<ExecutionStatus, StorageError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let status = self.status(execution_id).await?;
            if matches!(status, ExecutionStatus::Ended | ExecutionStatus::Failed) {
                return Ok(status);
            }
            if std::time::Instant::now() >= deadline {
                return Err(StorageError::WaitTimeout(execution_id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn execution_report(&self, execution_id: &str) -> Result<ExecutionReport, StorageError> {
        let status = self.status(execution_id).await?;
        let rows = sqlx::query("SELECT uuid, status, started, ended FROM jobs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let jobs = rows
            .into_iter()
            .map(|row| JobReport {
                uuid: Uuid::parse_str(&row.get::<String, _>("uuid")).expect("stored uuid is valid"),
                status: row.get::<String, _>("status").parse().expect("stored status is valid"),
                started: row.get("started"),
                ended: row.get("ended"),
                stdout_path: None,
                stderr_path: None,
            })
            .collect();

        Ok(ExecutionReport { id: execution_id.to_string(), status, jobs })
    }

    /// Releases all backing resources.
    pub async fn dispose(&self, execution_id: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM jobs WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}
