//! Compiles pipelines to workflows, persists them, and drives workers
//! that execute jobs as OS subprocesses (spec.md §4.5-4.6, §2 Engine/
//! Workers). Workers running as subprocesses is grounded in the original
//! `engine/local.py`'s `subprocess.Popen([... 'capsul.engine.local',
//! execution_id])` plus its worker-side `subprocess.check_call(command,
//! env=env, ...)` loop.

use std::collections::HashMap;
use std::process::Stdio;

use capsul_sdk::pipeline::Pipeline;
use indexmap::IndexMap;
use tokio::process::Command;
use tracing::{info, warn};

use crate::compiler::WorkflowCompiler;
use crate::conf::engine::EngineConfig;
use crate::storage::{ExecutionDatabase, ExecutionReport, ExecutionStatus, StorageError};

/// Environment variables consumed by workers (spec.md §6).
pub const ENV_DATABASE: &str = "CAPSUL_DATABASE";
pub const ENV_TMP: &str = "CAPSUL_TMP";

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("no engine block named '{0}' in configuration")]
    UnknownEngine(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("job {0} failed")]
    JobFailed(uuid::Uuid),
}

/// One configured execution engine: its database connection and worker
/// pool size, resolved from an [`EngineConfig`] block.
pub struct Engine {
    pub name: String,
    pub database: ExecutionDatabase,
    pub start_workers: u64,
}

impl Engine {
    pub async fn new(config: &EngineConfig, engine_name: &str) -> Result<Self, EngineError> {
        let block = config
            .engines
            .get(engine_name)
            .ok_or_else(|| EngineError::UnknownEngine(engine_name.to_string()))?;
        let db_path = config
            .database_path(engine_name)
            .ok_or_else(|| EngineError::UnknownEngine(engine_name.to_string()))?;

        let database = ExecutionDatabase::new(db_path).await?;
        Ok(Engine {
            name: engine_name.to_string(),
            database,
            start_workers: block.start_workers,
        })
    }

    /// Compiles `pipeline` and persists the resulting workflow in state
    /// `ready` (spec.md §4.6 `new_execution`).
    pub async fn submit(&self, pipeline: &Pipeline, boundary: &IndexMap<String, capsul_sdk::node::Plug>) -> Result<String, EngineError> {
        let _ = boundary;
        let (workflow, store) = WorkflowCompiler::compile(pipeline, "");
        let id = self.database.new_execution(&self.name, workflow, store).await?;
        Ok(id)
    }

    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStatus, EngineError> {
        Ok(self.database.status(execution_id).await?)
    }

    pub async fn wait(&self, execution_id: &str, timeout: std::time::Duration) -> Result<ExecutionStatus, EngineError> {
        Ok(self.database.wait(execution_id, timeout).await?)
    }

    pub async fn execution_report(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        Ok(self.database.execution_report(execution_id).await?)
    }

    pub async fn dispose(&self, execution_id: &str) -> Result<(), EngineError> {
        Ok(self.database.dispose(execution_id).await?)
    }

    /// Cancels a still-running execution (spec.md §5 Cancellation).
    pub async fn stop(&self, execution_id: &str, kill_running: bool) -> Result<(), EngineError> {
        Ok(self.database.stop(execution_id, kill_running).await?)
    }

    /// Spawns `start_workers` local worker processes against
    /// `worker_binary`, one execution each, passed the execution id as
    /// its single positional argument (spec.md §6 worker CLI).
    pub fn spawn_workers(&self, worker_binary: &str, execution_id: &str, db_path: &str, tmp_dir: &str) -> Vec<tokio::process::Child> {
        (0..self.start_workers.max(1))
            .filter_map(|_| {
                Command::new(worker_binary)
                    .arg(execution_id)
                    .env(ENV_DATABASE, db_path)
                    .env(ENV_TMP, tmp_dir)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| warn!("failed to spawn worker: {e}"))
                    .ok()
            })
            .collect()
    }
}

/// Runs every ready job of one execution in this process, claiming and
/// completing through `database` until none remain — the single-process
/// fallback for `start_workers = 0` and the shape the worker binary's
/// `main` drives (spec.md §4.6 `claim`/`complete`).
pub struct LocalExecutor<'a> {
    pub database: &'a ExecutionDatabase,
}

impl<'a> LocalExecutor<'a> {
    pub async fn run_to_completion(&self, execution_id: &str) -> Result<(), EngineError> {
        loop {
            let Some(job) = self.database.claim(execution_id).await? else {
                break;
            };

            let outcome = self.run_job(&job).await;
            let succeeded = outcome.is_ok();
            if let Err(e) = &outcome {
                warn!("job {} failed: {e}", job.uuid);
            }
            self.database
                .complete(execution_id, job.uuid, &job.node_path, job.resolved_parameters.clone(), succeeded)
                .await?;
        }
        Ok(())
    }

    async fn run_job(&self, job: &crate::compiler::Job) -> Result<(), EngineError> {
        if job.command.is_empty() {
            // Synthetic map/reduce fan-out/fan-in nodes carry no command.
            return Ok(());
        }
        info!("running job {} ({})", job.uuid, job.node_path);
        let status = Command::new(&job.command[0])
            .args(&job.command[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|_| EngineError::JobFailed(job.uuid))?;

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::JobFailed(job.uuid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Job, JobStatus, Workflow, WorkflowCompiler};
    use crate::conf::engine::{DatabaseConfig, EngineBlock, EngineConfig};
    use capsul_sdk::controller::{Field, FieldType, FieldValue};
    use capsul_sdk::node::{Endpoint, Link};
    use capsul_sdk::process::ProcessSpec;
    use std::sync::Arc;

    struct TouchProcess;
    impl capsul_sdk::process::ProcessDefinition for TouchProcess {
        fn definition_id(&self) -> &str {
            "test.touch"
        }
        fn command(&self, parameters: &HashMap<String, FieldValue>) -> Option<Vec<String>> {
            let path = parameters.get("out")?.as_str()?.to_string();
            Some(vec!["touch".to_string(), path])
        }
    }

    /// Compiles a real two-stage pipeline (`write` -> `read`), submits it
    /// through a configured [`Engine`], and runs it end to end: the
    /// dependent job must observe the file the first job created,
    /// matching the S5 "one worker, final status ended" scenario.
    #[tokio::test]
    async fn engine_compiles_and_runs_a_linked_pipeline_end_to_end() {
        capsul_sdk::registry::register_process(Arc::new(TouchProcess));

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("marker").to_string_lossy().to_string();

        let mut pipeline = capsul_sdk::pipeline::Pipeline::new();
        let mut writer = capsul_sdk::pipeline::Node::process("writer", ProcessSpec::new("test.touch"));
        writer.add_field(Field::new("out", FieldType::Str).output(true)).unwrap();
        writer
            .controller
            .set_value("out", FieldValue::from_str(out_path.clone()))
            .unwrap();
        pipeline.add_node(writer).unwrap();

        let mut reader = capsul_sdk::pipeline::Node::process("reader", ProcessSpec::new("test.touch"));
        reader.add_field(Field::new("out", FieldType::Str).output(true)).unwrap();
        reader
            .controller
            .set_value("out", FieldValue::from_str(out_path))
            .unwrap();
        pipeline.add_node(reader).unwrap();

        let mut boundary = IndexMap::new();
        pipeline
            .add_link(&mut boundary, Link::new(Endpoint::Node("writer".into()), "out", Endpoint::Node("reader".into()), "out"))
            .unwrap();
        pipeline.recompute_activation(&mut boundary);

        let mut config = EngineConfig::default();
        config.databases.insert("default".to_string(), DatabaseConfig { path: ":memory:".to_string() });
        config.engines.insert(
            "default".to_string(),
            EngineBlock { database: "default".to_string(), persistent: false, start_workers: 1, dataset: HashMap::new(), modules: HashMap::new() },
        );

        let engine = Engine::new(&config, "default").await.unwrap();
        let (workflow, store) = WorkflowCompiler::compile(&pipeline, "");
        assert_eq!(workflow.jobs.len(), 2);
        let writer_uuid = workflow.jobs.iter().find(|j| j.node_path == "writer").unwrap().uuid;
        let reader_job = workflow.jobs.iter().find(|j| j.node_path == "reader").unwrap();
        assert_eq!(reader_job.wait_for, vec![writer_uuid], "reader must wait on writer");
        let reader_uuid = reader_job.uuid;

        let id = engine.database.new_execution("default", workflow, store).await.unwrap();
        let executor = LocalExecutor { database: &engine.database };
        executor.run_to_completion(&id).await.unwrap();

        assert_eq!(engine.status(&id).await.unwrap(), ExecutionStatus::Ended);
        let report = engine.execution_report(&id).await.unwrap();
        assert_eq!(report.jobs.len(), 2);
        assert!(report.jobs.iter().all(|j| j.status == JobStatus::Done));

        let writer_report = report.jobs.iter().find(|j| j.uuid == writer_uuid).unwrap();
        let reader_report = report.jobs.iter().find(|j| j.uuid == reader_uuid).unwrap();
        assert!(writer_report.ended.unwrap() <= reader_report.started.unwrap(), "happens-before: writer must end before reader starts");

        engine.dispose(&id).await.unwrap();
    }

    #[tokio::test]
    async fn local_executor_runs_every_job_to_completion() {
        let database = ExecutionDatabase::new(":memory:").await.unwrap();
        let a = Job::new(vec!["true".to_string()], vec![]);
        let b = Job::new(vec!["true".to_string()], vec![a.uuid]);
        let workflow = Workflow { jobs: vec![a.clone(), b.clone()] };
        let id = database.new_execution("test", workflow, crate::compiler::ParameterStore::new()).await.unwrap();

        let executor = LocalExecutor { database: &database };
        executor.run_to_completion(&id).await.unwrap();

        assert_eq!(database.status(&id).await.unwrap(), ExecutionStatus::Ended);
    }

    #[tokio::test]
    async fn local_executor_marks_execution_failed_on_job_failure() {
        let database = ExecutionDatabase::new(":memory:").await.unwrap();
        let a = Job::new(vec!["false".to_string()], vec![]);
        let workflow = Workflow { jobs: vec![a] };
        let id = database.new_execution("test", workflow, crate::compiler::ParameterStore::new()).await.unwrap();

        let executor = LocalExecutor { database: &database };
        executor.run_to_completion(&id).await.unwrap();

        assert_eq!(database.status(&id).await.unwrap(), ExecutionStatus::Failed);
    }

    /// S6: `B.wait_for={A}`, `A` fails. The execution must end `failed`
    /// and `B` must never be claimed — it should be observed `cancelled`
    /// in the execution report, not `ready` forever nor `done`.
    #[tokio::test]
    async fn failing_upstream_job_prevents_downstream_from_ever_starting() {
        let database = ExecutionDatabase::new(":memory:").await.unwrap();
        let a = Job::new(vec!["false".to_string()], vec![]);
        let b = Job::new(vec!["true".to_string()], vec![a.uuid]);
        let b_uuid = b.uuid;
        let workflow = Workflow { jobs: vec![a, b] };
        let id = database.new_execution("test", workflow, crate::compiler::ParameterStore::new()).await.unwrap();

        let executor = LocalExecutor { database: &database };
        executor.run_to_completion(&id).await.unwrap();

        assert_eq!(database.status(&id).await.unwrap(), ExecutionStatus::Failed);
        let report = database.execution_report(&id).await.unwrap();
        let b_report = report.jobs.iter().find(|j| j.uuid == b_uuid).unwrap();
        assert_eq!(b_report.status, JobStatus::Cancelled, "downstream job must never start once its dependency failed");
        assert!(b_report.started.is_none(), "a cancelled job was never claimed");
    }
}
