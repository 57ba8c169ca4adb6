//! Job lifecycle operations shared by the HTTP surface and the CLI tools.

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{JobStatus, LogLevel, SyncJob};
use crate::runner::TokenRegistry;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("sync job {0} not found")]
    NotFound(Uuid),
    #[error("cannot abort job with status '{status}'")]
    InvalidState { status: JobStatus },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub async fn job_status(pool: &Pool, job_id: Uuid) -> Result<SyncJob, JobError> {
    db::get_sync_job(pool, job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))
}

/// Abort a queued or running job. The row flip is the authoritative
/// exactly-once transition; cancelling the token merely shortens a run
/// already in flight.
pub async fn abort_job(
    pool: &Pool,
    registry: &TokenRegistry,
    job_id: Uuid,
) -> Result<SyncJob, JobError> {
    let job = job_status(pool, job_id).await?;
    if job.status.is_terminal() {
        return Err(JobError::InvalidState { status: job.status });
    }

    let flipped =
        db::finalize_sync_job(pool, job_id, JobStatus::Cancelled, Some("Job cancelled by user"))
            .await?;
    if !flipped {
        // Lost the race against a finishing run.
        let job = job_status(pool, job_id).await?;
        return Err(JobError::InvalidState { status: job.status });
    }

    db::add_sync_log(
        pool,
        job_id,
        None,
        LogLevel::Warning,
        "Sync job cancelled by user",
    )
    .await?;
    registry.cancel(job_id).await;
    warn!(%job_id, "sync job cancelled");
    job_status(pool, job_id).await
}
