//! Job handlers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::JobContext;
use crate::core::{Job, JobId, Mesh, Outcome, StepMetrics};
use crate::errors::{ConfigurationError, DentalflowError};
use crate::pipeline::{PipelineCatalog, PipelineExecutor, PipelineStepConfig, StepObserver};

/// Job type served by [`PipelineJobHandler`].
pub const PIPELINE_JOB_TYPE: &str = "pipeline";

/// Runs the operation behind one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler serves.
    fn job_type(&self) -> &str;

    /// Runs one attempt. Must check `ctx` for cancellation at its natural
    /// boundaries.
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Outcome<Value>;
}

/// Handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. Each job type may be registered once.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<(), ConfigurationError> {
        let job_type = handler.job_type().to_string();
        if self.handlers.contains_key(&job_type) {
            return Err(ConfigurationError::new(format!(
                "handler for job type {job_type} already registered"
            ))
            .with_field("job_type"));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Builder form of [`Self::register`].
    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Result<Self, ConfigurationError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Handler for a job type.
    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    #[must_use]
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Storage for mesh payloads, owned by the outside world.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MeshRepository: Send + Sync {
    /// Loads the mesh stored under `file_id`.
    async fn load(&self, file_id: &str) -> anyhow::Result<Mesh>;

    /// Stores a job's output mesh and returns its file id.
    async fn store(&self, job_id: JobId, mesh: &Mesh) -> anyhow::Result<String>;
}

/// Runs the job's pipeline over its input file.
///
/// Expects `job.pipeline` and `job.file_id`. The output mesh is written
/// back through the [`MeshRepository`]; the job result summarizes it with
/// per-step metrics.
pub struct PipelineJobHandler {
    catalog: Arc<PipelineCatalog>,
    executor: PipelineExecutor,
    meshes: Arc<dyn MeshRepository>,
}

impl PipelineJobHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(catalog: Arc<PipelineCatalog>, executor: PipelineExecutor, meshes: Arc<dyn MeshRepository>) -> Self {
        Self {
            catalog,
            executor,
            meshes,
        }
    }
}

struct ProgressObserver<'a> {
    ctx: &'a JobContext,
}

#[async_trait]
impl StepObserver for ProgressObserver<'_> {
    async fn on_step_start(&self, _index: usize, _total: usize, _step: &PipelineStepConfig) {
        if let Err(err) = self.ctx.heartbeat().await {
            debug!(error = %err, "Heartbeat at step boundary failed");
        }
    }

    async fn on_step_complete(&self, index: usize, total: usize, _metrics: &StepMetrics) {
        // 100 is reserved for completion
        let percent = (index + 1) * 95 / total.max(1);
        let percent = i32::try_from(percent).unwrap_or(95);
        if let Err(err) = self.ctx.report_progress(percent).await {
            debug!(error = %err, "Progress report failed");
        }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    fn job_type(&self) -> &str {
        PIPELINE_JOB_TYPE
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> Outcome<Value> {
        let Some(pipeline) = &job.pipeline else {
            return Outcome::Fatal("pipeline job has no pipeline reference".to_string());
        };
        let Some(config) = self.catalog.get(pipeline) else {
            return Outcome::Fatal(format!("unknown pipeline {pipeline}"));
        };
        let Some(file_id) = job.file_id.as_deref() else {
            return Outcome::Fatal("pipeline job has no file_id".to_string());
        };

        let mesh = match self.meshes.load(file_id).await {
            Ok(mesh) => mesh,
            Err(err) => return Outcome::Retryable(format!("failed to load mesh {file_id}: {err:#}")),
        };
        let input_fingerprint = mesh.fingerprint();

        let observer = ProgressObserver { ctx };
        let run = match self
            .executor
            .execute_with(mesh, &config, ctx.token(), &observer)
            .await
        {
            Ok(run) => run,
            Err(err) => return Outcome::from_error(&DentalflowError::from(err)),
        };

        let output_file_id = match self.meshes.store(job.id, &run.mesh).await {
            Ok(id) => id,
            Err(err) => return Outcome::Retryable(format!("failed to store output mesh: {err:#}")),
        };

        Outcome::Ok(json!({
            "pipeline": pipeline.to_string(),
            "input_fingerprint": input_fingerprint,
            "output_file_id": output_file_id,
            "output_fingerprint": run.mesh.fingerprint(),
            "vertices": run.mesh.vertex_count(),
            "faces": run.mesh.face_count(),
            "cache_hits": run.cache_hits(),
            "cache_misses": run.cache_misses(),
            "duration_ms": run.total_duration_ms(),
            "steps": run.metrics,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl JobHandler for Named {
        fn job_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Outcome<Value> {
            Outcome::Ok(Value::Null)
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = HandlerRegistry::new()
            .with(Arc::new(Named("export")))
            .unwrap()
            .with(Arc::new(Named("pipeline")))
            .unwrap();
        assert!(registry.register(Arc::new(Named("export"))).is_err());
        assert_eq!(registry.job_types(), vec!["export".to_string(), "pipeline".to_string()]);
        assert!(registry.get("pipeline").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
