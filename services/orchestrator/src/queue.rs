//! Job dispatcher contract.
//!
//! A job is a task id. Delivery is at-least-once, and a queue never hands
//! out the same id to two workers at the same time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// One handed-out job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: String,
    /// 1 on first delivery, higher on redelivery.
    pub attempts: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a task id. Ids already queued or in flight are ignored.
    async fn enqueue(&self, task_id: &str) -> Result<(), QueueError>;

    /// Claims the next ready job, or `None` if there is none right now.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, task_id: &str) -> Result<(), QueueError>;

    /// Marks a job finished-with-error. It is not redelivered.
    async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<(), QueueError>;

    /// Keeps an active delivery alive.
    async fn heartbeat(&self, _task_id: &str) -> Result<(), QueueError> {
        Ok(())
    }

    /// Waits up to `max` for new work. Polling queues just sleep.
    async fn wait_for_work(&self, max: Duration) {
        tokio::time::sleep(max).await
    }
}

/// Settled jobs remembered for inspection.
const SETTLED_HISTORY: usize = 256;

/// `attempts` holds entries only for queued or in-flight ids.
#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    attempts: HashMap<String, u32>,
    active: HashSet<String>,
    acked: VecDeque<String>,
    failed: VecDeque<(String, String)>,
}

fn remember<T>(log: &mut VecDeque<T>, item: T) {
    if log.len() == SETTLED_HISTORY {
        log.pop_front();
    }
    log.push_back(item);
}

/// In-process queue for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts an active job back on the queue as if its lease had expired.
    pub async fn redeliver(&self, task_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        if !st.active.remove(task_id) {
            return Err(QueueError::UnknownJob(task_id.to_string()));
        }
        st.pending.push_back(task_id.to_string());
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.state.lock().await.active.contains(task_id)
    }

    /// Most recently acked ids, oldest first.
    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.iter().cloned().collect()
    }

    /// Most recently failed ids with their reasons, oldest first.
    pub async fn failed(&self) -> Vec<(String, String)> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    /// Ids the queue still tracks attempts for.
    pub async fn tracked(&self) -> usize {
        self.state.lock().await.attempts.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, task_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        if st.active.contains(task_id) || st.pending.iter().any(|id| id == task_id) {
            debug!(task_id, "queue: already queued");
            return Ok(());
        }
        st.pending.push_back(task_id.to_string());
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut st = self.state.lock().await;
        let Some(task_id) = st.pending.pop_front() else {
            return Ok(None);
        };
        st.active.insert(task_id.clone());
        let attempts = st.attempts.entry(task_id.clone()).or_insert(0);
        *attempts += 1;
        Ok(Some(Delivery {
            attempts: *attempts,
            task_id,
        }))
    }

    async fn ack(&self, task_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        st.active.remove(task_id);
        st.attempts.remove(task_id);
        remember(&mut st.acked, task_id.to_string());
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        st.active.remove(task_id);
        st.pending.retain(|id| id != task_id);
        st.attempts.remove(task_id);
        remember(&mut st.failed, (task_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.notify.notified()).await;
    }
}
