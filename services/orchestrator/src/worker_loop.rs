use std::sync::Arc;
use std::time::Duration;

use metastore::{MetadataRepository, Page, Predicate, Task};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ExecutionError, ServiceError};
use crate::executor::JobExecutor;
use crate::queue::{Delivery, JobQueue};

/// Tasks read per page when looking for unfinished work.
const REQUEUE_BATCH: u64 = 500;

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub max_concurrent: usize,
    pub poll_every: Duration,
    pub heartbeat_every: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: worker_id(),
            max_concurrent: 2,
            poll_every: Duration::from_secs(5),
            heartbeat_every: Duration::from_secs(10),
        }
    }
}

pub fn worker_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string())
}

/// Pulls jobs until `cancel` fires, running at most `max_concurrent` at a
/// time. Returns once in-flight jobs have finished.
pub async fn run_worker_loop(
    executor: Arc<JobExecutor>,
    opts: WorkerOptions,
    cancel: CancellationToken,
) {
    let queue = executor.queue().clone();
    let slots = Arc::new(Semaphore::new(opts.max_concurrent.max(1)));
    info!(worker_id = %opts.worker_id, max_concurrent = opts.max_concurrent, "worker_loop: started");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        match queue.receive().await {
            Ok(Some(delivery)) => {
                let executor = executor.clone();
                let queue = queue.clone();
                let heartbeat_every = opts.heartbeat_every;
                tokio::spawn(async move {
                    run_delivery(executor, queue, delivery, heartbeat_every).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.wait_for_work(opts.poll_every) => {}
                }
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, "worker_loop: receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(opts.poll_every) => {}
                }
            }
        }
    }

    // wait for in-flight jobs
    let _ = slots.acquire_many(opts.max_concurrent.max(1) as u32).await;
    info!(worker_id = %opts.worker_id, "worker_loop: stopped");
}

async fn run_delivery(
    executor: Arc<JobExecutor>,
    queue: Arc<dyn JobQueue>,
    delivery: Delivery,
    heartbeat_every: Duration,
) {
    let task_id = delivery.task_id.clone();
    if delivery.is_redelivery() {
        warn!(task_id = %task_id, attempts = delivery.attempts, "worker: job redelivered");
    } else {
        info!(task_id = %task_id, "worker: starting job");
    }

    let stop_heartbeat = CancellationToken::new();
    let hb = {
        let stop = stop_heartbeat.clone();
        let queue = queue.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(heartbeat_every) => {
                        if let Err(e) = queue.heartbeat(&task_id).await {
                            warn!(task_id = %task_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    };

    let result = executor.execute(&task_id).await;
    stop_heartbeat.cancel();
    let _ = hb.await;

    let settled = match &result {
        Ok(status) => {
            info!(task_id = %task_id, status = status.as_str(), "worker: job done");
            queue.ack(&task_id).await
        }
        // the executor already told the queue
        Err(ExecutionError::TaskNotFound(_)) => Ok(()),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "worker: job failed");
            queue.mark_failed(&task_id, &e.to_string()).await
        }
    };
    if let Err(e) = settled {
        error!(task_id = %task_id, error = %e, "worker: could not settle job with queue");
    }
}

/// Re-enqueues every task that has not reached a terminal state, e.g.
/// after a restart with a queue that does not survive the process. Tasks
/// still `Started` are failed as interrupted when they come back around.
pub async fn requeue_unfinished(
    repo: &MetadataRepository,
    queue: &dyn JobQueue,
) -> Result<usize, ServiceError> {
    requeue_in_batches(repo, queue, REQUEUE_BATCH).await
}

async fn requeue_in_batches(
    repo: &MetadataRepository,
    queue: &dyn JobQueue,
    batch: u64,
) -> Result<usize, ServiceError> {
    let mut requeued = 0;
    let mut offset = 0;
    loop {
        let page = Page {
            offset,
            limit: batch,
        };
        let tasks = repo.list::<Task>(&Predicate::True, page).await?;
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            queue.enqueue(&task.id).await?;
            requeued += 1;
        }
        if (tasks.len() as u64) < batch {
            break;
        }
        offset += batch;
    }
    if requeued > 0 {
        info!(requeued, "worker_loop: requeued unfinished tasks");
    }
    Ok(requeued)
}
