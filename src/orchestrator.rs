//! Drives a sync job end to end: load credentials, pull notes from Keep,
//! mirror each note into Notion, and keep the job row honest throughout.
//!
//! One note failing is routine and only bumps the failure counter. Losing
//! the extractor or the store ends the whole run.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::keep::KeepService;
use crate::model::{Credentials, JobStatus, LogLevel, NoteRecord, SyncJob, SyncReport};
use crate::notify::Notifier;
use crate::notion::NotionService;
use crate::vault::TokenCipher;

pub struct SyncOrchestrator {
    pool: Pool,
    keep: Arc<dyn KeepService>,
    notion: Arc<dyn NotionService>,
    cipher: Arc<TokenCipher>,
    notifier: Arc<Notifier>,
    note_limit: Option<u32>,
}

enum NoteOutcome {
    Synced(String),
    Failed(String),
}

impl SyncOrchestrator {
    pub fn new(
        pool: Pool,
        keep: Arc<dyn KeepService>,
        notion: Arc<dyn NotionService>,
        cipher: Arc<TokenCipher>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            pool,
            keep,
            notion,
            cipher,
            notifier,
            note_limit: None,
        }
    }

    /// Cap how many notes a single run pulls from the extractor.
    pub fn with_note_limit(mut self, limit: Option<u32>) -> Self {
        self.note_limit = limit;
        self
    }

    /// Run one job to a terminal state. Returns Err only when the store
    /// itself failed and the outcome could not be recorded.
    #[instrument(skip_all, fields(%job_id, user_id))]
    pub async fn execute_sync(
        &self,
        job_id: Uuid,
        user_id: &str,
        full_sync: bool,
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        db::create_sync_job(&self.pool, job_id, user_id, full_sync).await?;
        if !db::start_sync_job(&self.pool, job_id).await? {
            // Cancelled before it was ever picked up.
            info!("sync job was finished before it started");
            return self.report(job_id).await;
        }
        db::add_sync_log(
            &self.pool,
            job_id,
            None,
            LogLevel::Info,
            &format!("Starting sync for user {user_id}"),
        )
        .await?;

        match self.run(job_id, user_id, full_sync, &cancel).await {
            Ok(report) => Ok(report),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "sync job failed");
                if let Err(store_err) = self.record_failure(job_id, &message).await {
                    warn!(error = %format!("{store_err:#}"), "failed to record sync failure");
                    return Err(err);
                }
                self.notifier
                    .critical_error(
                        job_id,
                        user_id,
                        &message,
                        json!({ "stage": "sync_execution", "full_sync": full_sync }),
                    )
                    .await;
                self.report(job_id).await
            }
        }
    }

    async fn run(
        &self,
        job_id: Uuid,
        user_id: &str,
        full_sync: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let Some(creds) = db::get_credentials(&self.pool, &self.cipher, user_id).await? else {
            let message = format!("No credentials found for user {user_id}");
            db::finalize_sync_job(&self.pool, job_id, JobStatus::Failed, Some(&message)).await?;
            db::add_sync_log(&self.pool, job_id, None, LogLevel::Error, &message).await?;
            self.notifier
                .critical_error(job_id, user_id, &message, json!({ "stage": "credential_loading" }))
                .await;
            return self.report(job_id).await;
        };

        let window = if full_sync {
            None
        } else {
            self.last_sync_window(user_id).await?
        };
        let window_log = match window {
            Some(since) => format!("Fetching notes from Keep (modified_since={})", since.to_rfc3339()),
            None => "Fetching notes from Keep (full window)".to_string(),
        };
        db::add_sync_log(&self.pool, job_id, None, LogLevel::Info, &window_log).await?;

        // user_id doubles as the Google account name.
        let notes = self
            .keep
            .fetch_notes(user_id, &creds.google_oauth_token, window, self.note_limit)
            .await
            .context("failed to fetch notes from Keep")?;

        let total = notes.len() as i64;
        db::set_sync_job_total(&self.pool, job_id, total).await?;
        db::add_sync_log(
            &self.pool,
            job_id,
            None,
            LogLevel::Info,
            &format!("Fetched {total} notes from Keep"),
        )
        .await?;

        for note in &notes {
            if cancel.is_cancelled() {
                return self.stop_cancelled(job_id).await;
            }
            match self.process_note(user_id, &creds, note).await? {
                NoteOutcome::Synced(page_id) => {
                    db::increment_sync_job_progress(&self.pool, job_id, 1, 0).await?;
                    db::add_sync_log(
                        &self.pool,
                        job_id,
                        Some(&note.id),
                        LogLevel::Info,
                        &format!("Successfully synced note {} to Notion page {page_id}", note.id),
                    )
                    .await?;
                }
                NoteOutcome::Failed(message) => {
                    warn!(note_id = %note.id, error = %message, "failed to process note");
                    db::increment_sync_job_progress(&self.pool, job_id, 0, 1).await?;
                    db::add_sync_log(
                        &self.pool,
                        job_id,
                        Some(&note.id),
                        LogLevel::Error,
                        &format!("Failed to process note {}: {message}", note.id),
                    )
                    .await?;
                }
            }
        }

        let finished = db::finalize_sync_job(&self.pool, job_id, JobStatus::Completed, None).await?;
        if !finished {
            // The abort surface flipped the row between the last note and here.
            return self.stop_cancelled(job_id).await;
        }
        let job = self.job_row(job_id).await?;
        db::add_sync_log(
            &self.pool,
            job_id,
            None,
            LogLevel::Info,
            &format!(
                "Sync completed: {} processed, {} failed",
                job.processed_notes, job.failed_notes
            ),
        )
        .await?;
        info!(
            processed = job.processed_notes,
            failed = job.failed_notes,
            "sync job completed"
        );
        Ok(report_from(&job))
    }

    /// Create or refresh the Notion page for one note. Adapter failures are
    /// reported as an outcome; only store failures bubble up as Err.
    async fn process_note(
        &self,
        user_id: &str,
        creds: &Credentials,
        note: &NoteRecord,
    ) -> Result<NoteOutcome> {
        let existing = db::get_sync_record(&self.pool, user_id, &note.id).await?;
        let synced = match &existing {
            Some(record) => self
                .notion
                .update_page(&creds.notion_api_token, &record.notion_page_id, note)
                .await
                .map(|updated| updated.page_id),
            None => self
                .notion
                .create_page(&creds.notion_api_token, &creds.notion_database_id, note)
                .await
                .map(|created| created.page_id),
        };
        match synced {
            Ok(page_id) => {
                db::upsert_sync_state(&self.pool, user_id, &note.id, &page_id, note.modified_at)
                    .await?;
                Ok(NoteOutcome::Synced(page_id))
            }
            Err(err) => Ok(NoteOutcome::Failed(format!("{err:#}"))),
        }
    }

    /// Incremental window: the newest `last_synced_at` across the user's
    /// already-mirrored notes, None for a first sync.
    async fn last_sync_window(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let records = db::list_sync_state(&self.pool, user_id).await?;
        Ok(records.into_iter().map(|r| r.last_synced_at).max())
    }

    async fn stop_cancelled(&self, job_id: Uuid) -> Result<SyncReport> {
        db::finalize_sync_job(
            &self.pool,
            job_id,
            JobStatus::Cancelled,
            Some("Job cancelled by user"),
        )
        .await?;
        let job = self.job_row(job_id).await?;
        db::add_sync_log(
            &self.pool,
            job_id,
            None,
            LogLevel::Warning,
            &format!(
                "Sync stopped after cancellation: {} processed, {} failed",
                job.processed_notes, job.failed_notes
            ),
        )
        .await?;
        info!(
            processed = job.processed_notes,
            failed = job.failed_notes,
            "sync job cancelled"
        );
        Ok(report_from(&job))
    }

    async fn record_failure(&self, job_id: Uuid, message: &str) -> Result<()> {
        db::finalize_sync_job(&self.pool, job_id, JobStatus::Failed, Some(message)).await?;
        db::add_sync_log(
            &self.pool,
            job_id,
            None,
            LogLevel::Error,
            &format!("Sync failed: {message}"),
        )
        .await?;
        Ok(())
    }

    async fn report(&self, job_id: Uuid) -> Result<SyncReport> {
        let job = self.job_row(job_id).await?;
        Ok(report_from(&job))
    }

    async fn job_row(&self, job_id: Uuid) -> Result<SyncJob> {
        db::get_sync_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow!("sync job {job_id} missing from store"))
    }
}

fn report_from(job: &SyncJob) -> SyncReport {
    SyncReport {
        job_id: job.job_id,
        status: job.status,
        total_notes: job.total_notes,
        processed_notes: job.processed_notes,
        failed_notes: job.failed_notes,
        error: job.error_message.clone(),
    }
}
