//! End-to-end tests for submission, execution, retry and cancellation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::cache::InMemoryCacheStore;
use crate::config::EngineConfig;
use crate::core::{Job, JobId, JobStatus, NewJob, Outcome, PipelineRef};
use crate::events::{CollectingEventSink, JobEventKind};
use crate::jobs::{InMemoryJobStore, JobStateMachine, JobSubmitter};
use crate::pipeline::{AlgorithmKind, PipelineCatalog, PipelineConfig, PipelineExecutor, StepKind, StepRegistry};
use crate::testing::{counting_step, fake_registry, grid_mesh, RecordingMeshRepository};
use pretty_assertions::assert_eq;

struct Harness {
    machine: Arc<JobStateMachine>,
    broker: Arc<InMemoryBroker>,
    sink: Arc<CollectingEventSink>,
    ctx: Arc<WorkerContext>,
}

impl Harness {
    fn new(handlers: HandlerRegistry) -> Self {
        Self::with_config(handlers, test_config())
    }

    fn with_config(handlers: HandlerRegistry, config: EngineConfig) -> Self {
        let sink = Arc::new(CollectingEventSink::new());
        let machine = Arc::new(
            JobStateMachine::new(Arc::new(InMemoryJobStore::new())).with_event_sink(sink.clone()),
        );
        let broker = Arc::new(InMemoryBroker::new());
        let ctx = Arc::new(WorkerContext::new(
            config,
            Arc::clone(&machine),
            broker.clone(),
            Arc::new(handlers),
        ));
        Self {
            machine,
            broker,
            sink,
            ctx,
        }
    }

    async fn enqueue(&self, new: NewJob) -> Job {
        let job = self.machine.create(new).await.unwrap();
        self.broker.enqueue(WorkItem::from_job(&job), Duration::ZERO).await.unwrap();
        job
    }

    /// Processes visible items until the queue is empty.
    async fn drain(&self) -> Vec<TaskOutcome> {
        let executor = TaskExecutor::new(Arc::clone(&self.ctx));
        let mut outcomes = Vec::new();
        while self.broker.ready_len() > 0 {
            let item = self.broker.receive().await.unwrap();
            outcomes.push(executor.process(item).await.unwrap());
        }
        outcomes
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryPolicy::new()
        .with_base_delay_ms(0)
        .with_jitter(JitterStrategy::None);
    config
}

/// A handler that returns the same outcome every time and counts calls.
struct Scripted {
    job_type: &'static str,
    outcome: Outcome<Value>,
    calls: Mutex<usize>,
}

impl Scripted {
    fn new(job_type: &'static str, outcome: Outcome<Value>) -> Arc<Self> {
        Arc::new(Self {
            job_type,
            outcome,
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl JobHandler for Scripted {
    fn job_type(&self) -> &str {
        self.job_type
    }

    async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Outcome<Value> {
        *self.calls.lock() += 1;
        self.outcome.clone()
    }
}

/// Waits for cancellation, or forever.
struct Blocking {
    honor_token: bool,
}

#[async_trait]
impl JobHandler for Blocking {
    fn job_type(&self) -> &str {
        "blocking"
    }

    async fn handle(&self, _job: &Job, ctx: &JobContext) -> Outcome<Value> {
        if self.honor_token {
            ctx.token().cancelled().await;
            Outcome::Retryable("stopped".to_string())
        } else {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Outcome::Ok(Value::Null)
        }
    }
}

fn handlers(handler: Arc<dyn JobHandler>) -> HandlerRegistry {
    HandlerRegistry::new().with(handler).unwrap()
}

async fn wait_for_status(machine: &JobStateMachine, id: JobId, status: JobStatus) {
    while machine.get(id).await.unwrap().status != status {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn dental_ref() -> PipelineRef {
    let config = PipelineConfig::default_dental();
    PipelineRef::new(config.name, config.version)
}

#[tokio::test]
async fn test_dental_pipeline_reuses_cache_on_second_job() {
    let source = fake_registry();
    let (voxel, voxel_calls) = counting_step(
        source
            .get(StepKind::Decimate, AlgorithmKind::VoxelDownSample)
            .cloned()
            .unwrap(),
    );
    let registry = Arc::new(
        StepRegistry::new()
            .with(
                AlgorithmKind::StatisticalOutlierRemoval,
                source
                    .get(StepKind::Denoise, AlgorithmKind::StatisticalOutlierRemoval)
                    .cloned()
                    .unwrap(),
            )
            .unwrap()
            .with(AlgorithmKind::VoxelDownSample, voxel)
            .unwrap(),
    );

    let catalog = Arc::new(PipelineCatalog::new());
    catalog.register(PipelineConfig::default_dental()).unwrap();
    let meshes = Arc::new(RecordingMeshRepository::new().with_mesh("scan-1", grid_mesh(10_000)));
    let executor = PipelineExecutor::new(Arc::clone(&registry), Arc::new(InMemoryCacheStore::new()));
    let handler = PipelineJobHandler::new(Arc::clone(&catalog), executor, meshes.clone());
    let h = Harness::new(handlers(Arc::new(handler)));
    let submitter = JobSubmitter::new(Arc::clone(&h.machine), catalog, registry, h.broker.clone());

    let submit = || {
        NewJob::new(PIPELINE_JOB_TYPE)
            .with_pipeline(dental_ref())
            .with_file_id("scan-1")
    };
    let first = submitter.submit(submit()).await.unwrap();
    assert_eq!(h.drain().await, vec![TaskOutcome::Succeeded]);
    let second = submitter.submit(submit()).await.unwrap();
    assert_eq!(h.drain().await, vec![TaskOutcome::Succeeded]);

    let first = h.machine.get(first.id).await.unwrap();
    let second = h.machine.get(second.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(first.progress, 100);

    let (a, b) = (first.result.unwrap(), second.result.unwrap());
    assert_eq!(a["cache_misses"], json!(2));
    assert_eq!(b["cache_hits"], json!(2));
    assert_eq!(a["output_fingerprint"], b["output_fingerprint"]);
    assert_eq!(a["steps"].as_array().map(Vec::len), Some(2));
    assert_eq!(voxel_calls.load(Ordering::SeqCst), 1);

    let stored = meshes.stored();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].1, stored[1].1);

    assert_eq!(
        h.sink.kinds_for(first.id),
        vec![
            JobEventKind::Created,
            JobEventKind::Claimed,
            JobEventKind::Progress,
            JobEventKind::Progress,
            JobEventKind::Succeeded,
        ]
    );
}

#[tokio::test]
async fn test_retry_trace_ends_in_dead_letter() {
    let handler = Scripted::new("export", Outcome::Retryable("upstream unavailable".into()));
    let h = Harness::new(handlers(handler.clone()));
    let job = h.enqueue(NewJob::new("export").with_max_retries(1)).await;

    assert_eq!(
        h.drain().await,
        vec![TaskOutcome::Retrying { delay: Duration::ZERO }, TaskOutcome::DeadLettered]
    );
    assert_eq!(
        h.sink.kinds_for(job.id),
        vec![
            JobEventKind::Created,
            JobEventKind::Claimed,
            JobEventKind::Failed,
            JobEventKind::Requeued,
            JobEventKind::Claimed,
            JobEventKind::Failed,
            JobEventKind::DeadLettered,
        ]
    );

    let job = h.machine.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(!job.retry_scheduled);
    assert_eq!(job.error_message.as_deref(), Some("upstream unavailable"));

    let dead = h.broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item.job_id, job.id);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_retry_budget_is_respected() {
    let handler = Scripted::new("export", Outcome::Retryable("flaky".into()));
    let h = Harness::new(handlers(handler.clone()));
    let job = h.enqueue(NewJob::new("export").with_max_retries(2)).await;

    let outcomes = h.drain().await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.last(), Some(&TaskOutcome::DeadLettered));
    assert_eq!(handler.calls(), 3);
    assert_eq!(h.machine.get(job.id).await.unwrap().retry_count, 2);
}

#[tokio::test]
async fn test_fatal_outcome_fails_without_retry() {
    let handler = Scripted::new("export", Outcome::Fatal("corrupt scan".into()));
    let h = Harness::new(handlers(handler.clone()));
    let job = h.enqueue(NewJob::new("export")).await;

    assert_eq!(h.drain().await, vec![TaskOutcome::Failed]);
    let job = h.machine.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(h.broker.dead_letters().await.is_empty());
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_unknown_job_type_fails_permanently() {
    let h = Harness::new(HandlerRegistry::new());
    let job = h.enqueue(NewJob::new("mystery")).await;

    assert_eq!(h.drain().await, vec![TaskOutcome::Failed]);
    let job = h.machine.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("mystery"));
    assert!(h.broker.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_is_skipped() {
    let handler = Scripted::new("export", Outcome::Ok(json!({"ok": true})));
    let h = Harness::new(handlers(handler.clone()));
    let job = h.enqueue(NewJob::new("export")).await;
    h.broker.enqueue(WorkItem::from_job(&job), Duration::ZERO).await.unwrap();

    assert_eq!(h.drain().await, vec![TaskOutcome::Succeeded, TaskOutcome::Skipped]);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_time_limit_is_retryable() {
    let mut config = test_config();
    config.worker.task_time_limit_secs = 1;
    let h = Harness::with_config(handlers(Arc::new(Blocking { honor_token: false })), config);
    let job = h.enqueue(NewJob::new("blocking").with_max_retries(1)).await;

    let executor = TaskExecutor::new(Arc::clone(&h.ctx));
    let item = h.broker.receive().await.unwrap();
    let outcome = executor.process(item).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Retrying { delay: Duration::ZERO });

    let failed = h
        .sink
        .events_for(job.id)
        .into_iter()
        .find(|e| e.kind == JobEventKind::Failed)
        .unwrap();
    assert!(failed.message.unwrap().contains("time limit"));

    let job = h.machine.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(h.ctx.cancellations().is_empty());
}

#[tokio::test]
async fn test_cancel_stops_running_job() {
    let h = Harness::new(handlers(Arc::new(Blocking { honor_token: true })));
    let job = h.enqueue(NewJob::new("blocking")).await;

    let executor = TaskExecutor::new(Arc::clone(&h.ctx));
    let item = h.broker.receive().await.unwrap();
    let running = tokio::spawn(async move { executor.process(item).await });

    wait_for_status(&h.machine, job.id, JobStatus::Processing).await;
    h.machine.cancel(job.id, "operator request").await.unwrap();

    assert_eq!(running.await.unwrap().unwrap(), TaskOutcome::Cancelled);
    let job = h.machine.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!h.sink.kinds_for(job.id).contains(&JobEventKind::Failed));
    assert!(h.ctx.cancellations().is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_keeps_running_token() {
    let h = Harness::new(handlers(Arc::new(Blocking { honor_token: true })));
    let job = h.enqueue(NewJob::new("blocking")).await;

    let executor = TaskExecutor::new(Arc::clone(&h.ctx));
    let item = h.broker.receive().await.unwrap();
    let running = tokio::spawn(async move { executor.process(item).await });
    wait_for_status(&h.machine, job.id, JobStatus::Processing).await;

    let duplicate = TaskExecutor::new(Arc::clone(&h.ctx))
        .process(WorkItem::from_job(&job))
        .await
        .unwrap();
    assert_eq!(duplicate, TaskOutcome::Skipped);

    h.machine.cancel(job.id, "operator request").await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("running attempt should observe the cancel")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert!(h.ctx.cancellations().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_claim_is_skipped() {
    let handler = Scripted::new("export", Outcome::Ok(Value::Null));
    let h = Harness::new(handlers(handler.clone()));
    let job = h.enqueue(NewJob::new("export")).await;
    h.machine.cancel(job.id, "changed my mind").await.unwrap();

    assert_eq!(h.drain().await, vec![TaskOutcome::Skipped]);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_mesh_load_failure_is_retried_then_dead_lettered() {
    let mut meshes = MockMeshRepository::new();
    meshes
        .expect_load()
        .times(2)
        .returning(|file_id| Err(anyhow::anyhow!("object store timeout for {file_id}")));
    meshes.expect_store().never();

    let catalog = Arc::new(PipelineCatalog::new());
    catalog.register(PipelineConfig::default_dental()).unwrap();
    let executor = PipelineExecutor::new(Arc::new(fake_registry()), Arc::new(InMemoryCacheStore::new()));
    let handler = PipelineJobHandler::new(catalog, executor, Arc::new(meshes));
    let h = Harness::new(handlers(Arc::new(handler)));

    let job = h
        .enqueue(
            NewJob::new(PIPELINE_JOB_TYPE)
                .with_pipeline(dental_ref())
                .with_file_id("scan-9")
                .with_max_retries(1),
        )
        .await;

    assert_eq!(
        h.drain().await,
        vec![TaskOutcome::Retrying { delay: Duration::ZERO }, TaskOutcome::DeadLettered]
    );
    let job = h.machine.get(job.id).await.unwrap();
    assert!(job.error_message.unwrap().contains("scan-9"));
}

#[tokio::test]
async fn test_pipeline_job_without_file_is_fatal() {
    let catalog = Arc::new(PipelineCatalog::new());
    catalog.register(PipelineConfig::default_dental()).unwrap();
    let executor = PipelineExecutor::new(Arc::new(fake_registry()), Arc::new(InMemoryCacheStore::new()));
    let handler = PipelineJobHandler::new(catalog, executor, Arc::new(RecordingMeshRepository::new()));
    let h = Harness::new(handlers(Arc::new(handler)));

    h.enqueue(NewJob::new(PIPELINE_JOB_TYPE).with_pipeline(dental_ref())).await;
    assert_eq!(h.drain().await, vec![TaskOutcome::Failed]);
}

#[tokio::test]
async fn test_pool_drains_queue_and_stops() {
    let handler = Scripted::new("export", Outcome::Ok(json!({"exported": true})));
    let mut config = test_config();
    config.worker.concurrency = 3;
    let h = Harness::with_config(handlers(handler.clone()), config);

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(h.enqueue(NewJob::new("export")).await.id);
    }
    h.broker.close();

    let pool = WorkerPool::start(Arc::clone(&h.ctx));
    assert_eq!(pool.concurrency(), 3);
    pool.join().await;

    for id in ids {
        assert_eq!(h.machine.get(id).await.unwrap().status, JobStatus::Succeeded);
    }
    assert_eq!(handler.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_stuck_workers_after_timeout() {
    let mut config = test_config();
    config.worker.concurrency = 2;
    config.worker.shutdown_timeout_secs = 1;
    let h = Harness::with_config(handlers(Arc::new(Blocking { honor_token: false })), config);
    let job = h.enqueue(NewJob::new("blocking")).await;

    let pool = WorkerPool::start(Arc::clone(&h.ctx));
    wait_for_status(&h.machine, job.id, JobStatus::Processing).await;

    assert_eq!(pool.shutdown().await, 1);
}
