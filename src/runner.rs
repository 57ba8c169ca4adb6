//! Bounded submission queue feeding a single sync worker.
//!
//! Jobs run one at a time in submission order. Submitting past the queue
//! depth fails fast instead of buffering without bound.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub job_id: Uuid,
    pub user_id: String,
    pub full_sync: bool,
}

/// Cancellation tokens for in-flight jobs, keyed by job id.
#[derive(Clone, Default)]
pub struct TokenRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl TokenRegistry {
    pub async fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.tokens.lock().await.insert(job_id, token);
    }

    pub async fn deregister(&self, job_id: Uuid) {
        self.tokens.lock().await.remove(&job_id);
    }

    /// Cancel the token for a job. Returns whether one was live.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.lock().await.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("sync queue is full")]
    QueueFull,
    #[error("sync queue is closed")]
    Closed,
}

#[derive(Clone)]
pub struct RunnerHandle {
    queue: mpsc::Sender<SyncTask>,
    registry: TokenRegistry,
}

impl RunnerHandle {
    pub fn submit(&self, task: SyncTask) -> Result<(), SubmitError> {
        self.queue.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }
}

pub struct SyncRunner;

impl SyncRunner {
    /// Spawn the worker loop. Dropping every handle closes the queue; a run
    /// already in flight finishes before the worker exits.
    pub fn spawn(
        orchestrator: SyncOrchestrator,
        queue_depth: usize,
    ) -> (RunnerHandle, JoinHandle<()>) {
        let (queue, mut jobs) = mpsc::channel::<SyncTask>(queue_depth.max(1));
        let registry = TokenRegistry::default();
        let worker_registry = registry.clone();

        let worker = tokio::spawn(async move {
            while let Some(task) = jobs.recv().await {
                let token = CancellationToken::new();
                worker_registry.register(task.job_id, token.clone()).await;
                info!(job_id = %task.job_id, user_id = %task.user_id, "sync job picked up");

                match orchestrator
                    .execute_sync(task.job_id, &task.user_id, task.full_sync, token)
                    .await
                {
                    Ok(report) => info!(
                        job_id = %task.job_id,
                        status = %report.status,
                        processed = report.processed_notes,
                        failed = report.failed_notes,
                        "sync job finished"
                    ),
                    Err(err) => error!(
                        job_id = %task.job_id,
                        error = %format!("{err:#}"),
                        "sync job aborted by store failure"
                    ),
                }
                worker_registry.deregister(task.job_id).await;
            }
            info!("sync runner stopped");
        });

        (RunnerHandle { queue, registry }, worker)
    }
}
