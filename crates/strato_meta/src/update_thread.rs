//! Single-writer pipeline for topology mutations.
//!
//! Producers enqueue without blocking; one worker drains the queue in order
//! and applies each task through the info store. Transient failures are
//! retried with bounded exponential backoff, then the task is dropped with an
//! error log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cluster::UpdateTask;
use crate::info_store::InfoStore;

#[derive(Debug, Clone, Copy)]
pub struct UpdateThreadConfig {
    pub max_retry: u32,
    pub retry_base: Duration,
}

impl Default for UpdateThreadConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_base: Duration::from_millis(100),
        }
    }
}

/// Handle for enqueueing tasks; cheap to clone.
#[derive(Clone)]
pub struct UpdateThread {
    tx: mpsc::UnboundedSender<UpdateTask>,
}

impl UpdateThread {
    pub fn spawn(info: Arc<InfoStore>, cfg: UpdateThreadConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<UpdateTask>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                apply_with_retry(&info, task, cfg).await;
            }
        });
        Self { tx }
    }

    /// Append a task. Never blocks and never deduplicates; tasks enqueued
    /// from one critical section keep their relative order.
    pub fn pending_update(&self, task: UpdateTask) {
        if self.tx.send(task).is_err() {
            tracing::warn!("update queue closed, task dropped");
        }
    }
}

async fn apply_with_retry(info: &InfoStore, task: UpdateTask, cfg: UpdateThreadConfig) {
    let mut attempt = 0u32;
    loop {
        match info.apply(&task).await {
            Ok(()) => {
                tracing::debug!(?task, "topology update applied");
                return;
            }
            Err(err) if err.is_transient() && attempt < cfg.max_retry => {
                let delay = cfg.retry_base * 2u32.saturating_pow(attempt);
                attempt += 1;
                tracing::warn!(?task, error = %err, attempt, delay_ms = delay.as_millis() as u64,
                    "transient apply failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(?task, error = %err, "topology update dropped");
                return;
            }
        }
    }
}
