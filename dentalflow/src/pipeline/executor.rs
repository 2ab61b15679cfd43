//! Sequential pipeline execution with per-step caching.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{CacheKeyInput, PipelineConfig, PipelineStepConfig, StepDefinition, StepOutput, StepRegistry};
use crate::cache::{CacheArtifact, CacheStore, PutOutcome};
use crate::cancellation::CancellationToken;
use crate::core::{CacheOutcome, Mesh, Outcome, StepMetrics};
use crate::errors::{CacheError, ConfigurationError, PipelineError, StepExecutionError};
use crate::observability::SpanTimer;

/// Hooks called around every executed step.
#[async_trait]
pub trait StepObserver: Send + Sync {
    /// Called before step `index` of `total` runs.
    async fn on_step_start(&self, _index: usize, _total: usize, _step: &PipelineStepConfig) {}

    /// Called after step `index` of `total` produced its output.
    async fn on_step_complete(&self, _index: usize, _total: usize, _metrics: &StepMetrics) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StepObserver for NoopObserver {}

/// Output of a successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    /// Final mesh.
    pub mesh: Mesh,
    /// Metrics for every enabled step, in order.
    pub metrics: Vec<StepMetrics>,
}

impl PipelineRun {
    /// Number of steps served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.count(CacheOutcome::Hit)
    }

    /// Number of cache-eligible steps that had to be computed.
    #[must_use]
    pub fn cache_misses(&self) -> usize {
        self.count(CacheOutcome::Miss)
    }

    /// Sum of step compute durations.
    #[must_use]
    pub fn total_duration_ms(&self) -> f64 {
        self.metrics.iter().map(|m| m.duration_ms).sum()
    }

    fn count(&self, outcome: CacheOutcome) -> usize {
        self.metrics.iter().filter(|m| m.cache == outcome).count()
    }
}

/// Runs pipeline configurations against a step registry and a cache.
#[derive(Clone)]
pub struct PipelineExecutor {
    registry: Arc<StepRegistry>,
    cache: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: Arc<StepRegistry>, cache: Arc<dyn CacheStore>) -> Self {
        Self { registry, cache }
    }

    /// The step registry.
    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// The cache store.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Runs every enabled step of `config` over `mesh`.
    pub async fn execute(&self, mesh: Mesh, config: &PipelineConfig) -> Result<PipelineRun, PipelineError> {
        self.execute_with(mesh, config, &CancellationToken::new(), &NoopObserver)
            .await
    }

    /// Runs the pipeline, checking `token` before every step.
    ///
    /// The configuration is validated and checked against the registry
    /// before any step runs. A step failure aborts the run; outputs of
    /// earlier steps are dropped, but their cache entries stay.
    pub async fn execute_with(
        &self,
        mesh: Mesh,
        config: &PipelineConfig,
        token: &CancellationToken,
        observer: &dyn StepObserver,
    ) -> Result<PipelineRun, PipelineError> {
        let config = config.validated()?;
        self.registry.check_config(&config)?;

        let steps: Vec<&PipelineStepConfig> = config.enabled_steps().collect();
        let total = steps.len();
        let timer = SpanTimer::start(format!("pipeline {}@{}", config.name, config.version));
        let mut current = mesh;
        let mut metrics = Vec::with_capacity(total);

        for (index, step) in steps.into_iter().enumerate() {
            if token.is_cancelled() {
                let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
                info!(pipeline = %config.name, completed_steps = index, %reason, "Pipeline cancelled");
                return Err(PipelineError::Cancelled {
                    reason,
                    completed_steps: index,
                });
            }

            observer.on_step_start(index, total, step).await;
            let span = debug_span!(
                "step",
                step_kind = %step.step_kind,
                algorithm_kind = %step.algorithm_kind
            );
            let (next, step_metrics) = self.run_step(current, step, &config).instrument(span).await?;
            observer.on_step_complete(index, total, &step_metrics).await;

            metrics.push(step_metrics);
            current = next;
        }

        let run = PipelineRun { mesh: current, metrics };
        info!(
            pipeline = %config.name,
            version = %config.version,
            steps = run.metrics.len(),
            cache_hits = run.cache_hits(),
            elapsed_ms = timer.finish(),
            "Pipeline completed"
        );
        Ok(run)
    }

    async fn run_step(
        &self,
        input: Mesh,
        step: &PipelineStepConfig,
        config: &PipelineConfig,
    ) -> Result<(Mesh, StepMetrics), PipelineError> {
        let definition = self
            .registry
            .get(step.step_kind, step.algorithm_kind)
            .ok_or_else(|| {
                ConfigurationError::new(format!("no implementation registered for {}", step.algorithm_kind))
                    .with_step(step.step_kind.as_str())
            })?;
        let counts_in = (input.vertex_count(), input.face_count());

        let eligible = config.cache_enabled && step.cache_enabled && definition.deterministic;
        let key = eligible.then(|| {
            CacheKeyInput {
                fingerprint: &input.fingerprint(),
                step_kind: step.step_kind,
                algorithm_kind: step.algorithm_kind,
                parameters: &step.parameters,
                definition_version: definition.version,
            }
            .compute()
        });

        if let Some(key) = &key {
            if let Some(output) = self.lookup(key).await? {
                let metrics = StepMetrics::new(
                    step.step_kind,
                    step.algorithm_kind,
                    counts_in,
                    (output.mesh.vertex_count(), output.mesh.face_count()),
                )
                .with_cache(CacheOutcome::Hit, Some(key.clone()))
                .with_extra(output.metrics);
                debug!(cache_key = %key, "Step served from cache");
                return Ok((output.mesh, metrics));
            }
        }

        let timer = SpanTimer::start(format!("{}/{}", step.step_kind, step.algorithm_kind));
        let output = compute(definition, input, step).await?;
        let duration_ms = timer.finish();

        let outcome = if key.is_some() { CacheOutcome::Miss } else { CacheOutcome::Bypassed };
        let metrics = StepMetrics::new(
            step.step_kind,
            step.algorithm_kind,
            counts_in,
            (output.mesh.vertex_count(), output.mesh.face_count()),
        )
        .with_duration_ms(duration_ms)
        .with_cache(outcome, key.clone())
        .with_extra(output.metrics.clone());

        if let Some(key) = &key {
            let artifact = CacheArtifact::new(output.mesh.to_bytes(), output.metrics);
            match self.cache.put(key, artifact, config.cache_ttl).await {
                Ok(PutOutcome::Stored) => debug!(cache_key = %key, "Step output cached"),
                Ok(PutOutcome::Discarded) => {
                    debug!(cache_key = %key, "Concurrent writer cached this step first");
                }
                Err(err) => warn!(cache_key = %key, error = %err, "Failed to cache step output"),
            }
        }

        info!(duration_ms, cache = %outcome, "Step completed");
        Ok((output.mesh, metrics))
    }

    /// Reads a cached step output. Unreadable entries are evicted and
    /// reported as a miss.
    async fn lookup(&self, key: &str) -> Result<Option<StepOutput>, PipelineError> {
        let entry = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(CacheError::Corrupt(err)) => {
                warn!(cache_key = %key, error = %err, "Evicting corrupt cache entry");
                self.evict_quietly(key).await;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match Mesh::from_bytes(&entry.artifact.bytes) {
            Ok(mesh) => Ok(Some(StepOutput {
                mesh,
                metrics: entry.artifact.metrics,
            })),
            Err(err) => {
                warn!(cache_key = %key, error = %err, "Evicting undecodable cache artifact");
                self.evict_quietly(key).await;
                Ok(None)
            }
        }
    }

    async fn evict_quietly(&self, key: &str) {
        if let Err(err) = self.cache.evict(key).await {
            warn!(cache_key = %key, error = %err, "Failed to evict cache entry");
        }
    }
}

/// Runs a step function off the async runtime.
async fn compute(
    definition: &StepDefinition,
    input: Mesh,
    step: &PipelineStepConfig,
) -> Result<StepOutput, StepExecutionError> {
    let func = Arc::clone(&definition.func);
    let params = step.parameters.clone();
    let (step_kind, algorithm_kind) = (step.step_kind, step.algorithm_kind);

    let outcome = tokio::task::spawn_blocking(move || func(&input, &params))
        .await
        .map_err(|err| StepExecutionError::new(step_kind, algorithm_kind, format!("step task aborted: {err}")))?;

    match outcome {
        Outcome::Ok(output) => Ok(output),
        Outcome::Retryable(cause) => Err(StepExecutionError::new(step_kind, algorithm_kind, cause)),
        Outcome::Fatal(cause) => Err(StepExecutionError::new(step_kind, algorithm_kind, cause).fatal()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::pipeline::{AlgorithmKind, StepKind};
    use crate::testing::{fake_registry, failing_step, grid_mesh, scale_step};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn executor(registry: StepRegistry) -> (PipelineExecutor, Arc<InMemoryCacheStore>) {
        let cache = Arc::new(InMemoryCacheStore::new());
        (PipelineExecutor::new(Arc::new(registry), cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_second_run_hits_every_step() {
        let (executor, cache) = executor(fake_registry());
        let config = PipelineConfig::default_dental();
        let mesh = grid_mesh(10_000);

        let first = executor.execute(mesh.clone(), &config).await.unwrap();
        assert_eq!(first.cache_misses(), 2);
        assert_eq!(first.cache_hits(), 0);
        assert_eq!(first.metrics.len(), 2);

        let second = executor.execute(mesh, &config).await.unwrap();
        assert_eq!(second.cache_hits(), 2);
        assert_eq!(second.mesh.to_bytes(), first.mesh.to_bytes());
        assert!(second.total_duration_ms().abs() < f64::EPSILON);

        let keys = |run: &PipelineRun| run.metrics.iter().map(|m| m.cache_key.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&first), keys(&second));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_hit_replays_extra_metrics() {
        let (executor, _) = executor(fake_registry());
        let config = PipelineConfig::default_dental();
        let first = executor.execute(grid_mesh(500), &config).await.unwrap();
        let second = executor.execute(grid_mesh(500), &config).await.unwrap();
        assert_eq!(first.metrics[0].extra, second.metrics[0].extra);
        assert_eq!(first.metrics[1].output_vertices, second.metrics[1].output_vertices);
    }

    #[tokio::test]
    async fn test_parameter_change_forces_recompute() {
        let (executor, _) = executor(fake_registry());
        let base = PipelineConfig::default_dental();
        let mesh = grid_mesh(1_000);
        let first = executor.execute(mesh.clone(), &base).await.unwrap();

        let mut changed = base.clone();
        changed.steps[1] = changed.steps[1].clone().with_param("voxel_size", 0.1);
        let second = executor.execute(mesh, &changed).await.unwrap();

        assert_eq!(second.metrics[0].cache, CacheOutcome::Hit);
        assert_eq!(second.metrics[1].cache, CacheOutcome::Miss);
        assert_ne!(first.metrics[1].cache_key, second.metrics[1].cache_key);
    }

    #[tokio::test]
    async fn test_disabled_steps_skipped_and_cache_flags() {
        let (executor, cache) = executor(fake_registry());
        let mut config = PipelineConfig::default_dental();
        config.steps[0].enabled = false;
        config.steps[1].cache_enabled = false;

        let run = executor.execute(grid_mesh(100), &config).await.unwrap();
        assert_eq!(run.metrics.len(), 1);
        assert_eq!(run.metrics[0].step_kind, StepKind::Decimate);
        assert_eq!(run.metrics[0].cache, CacheOutcome::Bypassed);
        assert!(run.metrics[0].cache_key.is_none());
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_non_deterministic_step_never_cached() {
        let registry = registry_replacing(fake_registry(), AlgorithmKind::VoxelDownSample, scale_step());
        let (executor, cache) = executor(registry);
        let config = PipelineConfig::default_dental();

        executor.execute(grid_mesh(100), &config).await.unwrap();
        let run = executor.execute(grid_mesh(100), &config).await.unwrap();
        assert_eq!(run.metrics[0].cache, CacheOutcome::Hit);
        assert_eq!(run.metrics[1].cache, CacheOutcome::Bypassed);
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    fn registry_replacing(source: StepRegistry, algorithm: AlgorithmKind, definition: StepDefinition) -> StepRegistry {
        let mut registry = StepRegistry::new();
        for step in StepKind::ALL {
            for algo in step.algorithms() {
                let def = if *algo == algorithm {
                    definition.clone()
                } else {
                    match source.get(step, *algo) {
                        Some(def) => def.clone(),
                        None => continue,
                    }
                };
                registry.register(*algo, def).unwrap();
            }
        }
        registry
    }

    #[tokio::test]
    async fn test_step_failure_aborts_and_keeps_prior_cache() {
        let registry = registry_replacing(
            fake_registry(),
            AlgorithmKind::VoxelDownSample,
            failing_step("voxel grid exploded", true),
        );
        let (executor, cache) = executor(registry);
        let err = executor
            .execute(grid_mesh(100), &PipelineConfig::default_dental())
            .await
            .unwrap_err();

        match err {
            PipelineError::Step(step) => {
                assert_eq!(step.step_kind, StepKind::Decimate);
                assert_eq!(step.algorithm_kind, AlgorithmKind::VoxelDownSample);
                assert!(step.retryable);
                assert!(step.cause.contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_fatal_outcome_not_retryable() {
        let registry = registry_replacing(
            fake_registry(),
            AlgorithmKind::StatisticalOutlierRemoval,
            failing_step("bad geometry", false),
        );
        let (executor, _) = executor(registry);
        let err = executor
            .execute(grid_mesh(10), &PipelineConfig::default_dental())
            .await
            .unwrap_err();
        assert!(!err.class().is_retryable());
    }

    #[tokio::test]
    async fn test_unregistered_algorithm_fails_before_any_step() {
        let (executor, cache) = executor(StepRegistry::new());
        let err = executor
            .execute(grid_mesh(10), &PipelineConfig::default_dental())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(cache.stats().await.unwrap().misses, 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_at_boundary() {
        let (executor, _) = executor(fake_registry());
        let token = CancellationToken::new();
        token.cancel("user request");
        let err = executor
            .execute_with(grid_mesh(10), &PipelineConfig::default_dental(), &token, &NoopObserver)
            .await
            .unwrap_err();
        match err {
            PipelineError::Cancelled { reason, completed_steps } => {
                assert_eq!(reason, "user request");
                assert_eq!(completed_steps, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct Recorder {
        calls: Mutex<Vec<String>>,
        cancel_after_first: Option<Arc<CancellationToken>>,
    }

    #[async_trait]
    impl StepObserver for Recorder {
        async fn on_step_start(&self, index: usize, total: usize, step: &PipelineStepConfig) {
            self.calls.lock().push(format!("start {index}/{total} {}", step.step_kind));
        }

        async fn on_step_complete(&self, index: usize, total: usize, metrics: &StepMetrics) {
            self.calls.lock().push(format!("done {index}/{total} {}", metrics.step_kind));
            if let Some(token) = &self.cancel_after_first {
                token.cancel("stop");
            }
        }
    }

    #[tokio::test]
    async fn test_observer_sees_steps_and_mid_run_cancel() {
        let (executor, _) = executor(fake_registry());
        let token = Arc::new(CancellationToken::new());
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
            cancel_after_first: Some(Arc::clone(&token)),
        };
        let err = executor
            .execute_with(grid_mesh(10), &PipelineConfig::default_dental(), &token, &recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { completed_steps: 1, .. }));
        assert_eq!(
            recorder.calls.lock().clone(),
            vec!["start 0/2 denoise".to_string(), "done 0/2 denoise".to_string()]
        );
    }

    #[tokio::test]
    async fn test_corrupt_artifact_recomputed() {
        let (executor, cache) = executor(fake_registry());
        let config = PipelineConfig::new("single").with_step(
            PipelineStepConfig::new(StepKind::Decimate, AlgorithmKind::VoxelDownSample),
        );
        let first = executor.execute(grid_mesh(50), &config).await.unwrap();
        let key = first.metrics[0].cache_key.clone().unwrap();

        cache.evict(&key).await.unwrap();
        cache
            .put(&key, CacheArtifact::new(b"garbage".to_vec(), Default::default()), config.cache_ttl)
            .await
            .unwrap();

        let second = executor.execute(grid_mesh(50), &config).await.unwrap();
        assert_eq!(second.metrics[0].cache, CacheOutcome::Miss);
        assert_eq!(second.mesh, first.mesh);

        let third = executor.execute(grid_mesh(50), &config).await.unwrap();
        assert_eq!(third.metrics[0].cache, CacheOutcome::Hit);
    }
}
