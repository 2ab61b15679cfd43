//! A fixed-size pool of worker loops.

use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{TaskExecutor, WorkerContext};
use crate::cancellation::CancellationToken;
use crate::jobs::LivenessSweep;

/// Runs `worker.concurrency` loops that pull from the broker, plus the
/// liveness sweep.
///
/// Loops end when the broker is closed and drained, or on [`Self::shutdown`].
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: Arc<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    /// Starts the pool.
    #[must_use]
    pub fn start(ctx: Arc<WorkerContext>) -> Self {
        let shutdown = Arc::new(CancellationToken::new());
        let concurrency = ctx.settings().worker.concurrency.max(1);
        let workers = (0..concurrency)
            .map(|index| spawn_worker(index, Arc::clone(&ctx), Arc::clone(&shutdown)))
            .collect();

        let worker_settings = &ctx.settings().worker;
        let sweep = Arc::new(LivenessSweep::new(
            Arc::clone(ctx.machine()),
            Arc::clone(ctx.broker()),
            ctx.retry_policy().clone(),
            worker_settings.stale_after(),
        ));
        let maintenance = vec![sweep.spawn(worker_settings.heartbeat_interval(), Arc::clone(&shutdown))];

        info!(concurrency, "Worker pool started");
        Self {
            shutdown,
            workers,
            maintenance,
            ctx,
        }
    }

    /// Number of worker loops.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker loop to end, which happens once the broker
    /// is closed and drained. Stops the liveness sweep afterwards.
    pub async fn join(self) {
        join_all(self.workers).await;
        self.shutdown.cancel("workers finished");
        join_all(self.maintenance).await;
        info!("Worker pool stopped");
    }

    /// Stops taking new work and waits up to the configured shutdown
    /// timeout for in-flight jobs. Returns the number of loops aborted.
    pub async fn shutdown(self) -> usize {
        self.shutdown.cancel("shutdown");
        let timeout = self.ctx.settings().worker.shutdown_timeout();

        let mut workers = self.workers;
        let finished = tokio::time::timeout(timeout, join_all(workers.iter_mut())).await;
        let aborted = if finished.is_ok() {
            0
        } else {
            let running = workers.iter().filter(|h| !h.is_finished()).count();
            for handle in &workers {
                handle.abort();
            }
            warn!(aborted = running, "Shutdown timeout elapsed, aborting workers");
            running
        };

        join_all(self.maintenance).await;
        info!("Worker pool stopped");
        aborted
    }
}

fn spawn_worker(index: usize, ctx: Arc<WorkerContext>, shutdown: Arc<CancellationToken>) -> JoinHandle<()> {
    let executor = TaskExecutor::new(Arc::clone(&ctx));
    tokio::spawn(
        async move {
            loop {
                let item = tokio::select! {
                    () = shutdown.cancelled() => break,
                    item = ctx.broker().receive() => item,
                };
                let Some(item) = item else { break };
                match executor.process(item).await {
                    Ok(outcome) => debug!(?outcome, "Work item processed"),
                    Err(err) => error!(error = %err, "Work item processing failed"),
                }
            }
            debug!("Worker loop stopped");
        }
        .instrument(info_span!("worker", index)),
    )
}
