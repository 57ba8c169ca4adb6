use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keep_sync::db;
use keep_sync::keep::KeepService;
use keep_sync::model::{Credentials, ImageAttachment, JobStatus, LogLevel, NoteRecord};
use keep_sync::notify::Notifier;
use keep_sync::notion::{CreatedPage, NotionService, UpdatedPage};
use keep_sync::orchestrator::SyncOrchestrator;
use keep_sync::vault::{self, TokenCipher};

/// Keep double that records the requested window and hands back scripted
/// note batches.
#[derive(Clone, Default)]
struct RecordingKeep {
    calls: Arc<Mutex<Vec<(Option<DateTime<Utc>>, Option<u32>)>>>,
    responses: Arc<Mutex<VecDeque<Result<Vec<NoteRecord>>>>>,
}

impl RecordingKeep {
    async fn push_response(&self, response: Result<Vec<NoteRecord>>) {
        self.responses.lock().await.push_back(response);
    }

    async fn calls(&self) -> Vec<(Option<DateTime<Utc>>, Option<u32>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl KeepService for RecordingKeep {
    async fn fetch_notes(
        &self,
        _username: &str,
        _google_token: &str,
        modified_since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<NoteRecord>> {
        self.calls.lock().await.push((modified_since, limit));
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NotionCall {
    Create { database_id: String, note_id: String },
    Update { page_id: String, note_id: String },
}

/// Notion double. Without a scripted response it derives a page id from the
/// note id; an optional token is cancelled during each call to model a user
/// aborting a job mid-run.
#[derive(Clone, Default)]
struct RecordingNotion {
    calls: Arc<Mutex<Vec<NotionCall>>>,
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    cancel_during_call: Arc<Mutex<Option<CancellationToken>>>,
}

impl RecordingNotion {
    async fn push_response(&self, response: Result<String>) {
        self.responses.lock().await.push_back(response);
    }

    async fn cancel_during_calls(&self, token: CancellationToken) {
        *self.cancel_during_call.lock().await = Some(token);
    }

    async fn calls(&self) -> Vec<NotionCall> {
        self.calls.lock().await.clone()
    }

    async fn next_page_id(&self, fallback: String) -> Result<String> {
        if let Some(token) = self.cancel_during_call.lock().await.as_ref() {
            token.cancel();
        }
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(fallback))
    }
}

#[async_trait]
impl NotionService for RecordingNotion {
    async fn create_page(
        &self,
        _api_token: &str,
        database_id: &str,
        note: &NoteRecord,
    ) -> Result<CreatedPage> {
        self.calls.lock().await.push(NotionCall::Create {
            database_id: database_id.to_string(),
            note_id: note.id.clone(),
        });
        let page_id = self.next_page_id(format!("page-{}", note.id)).await?;
        Ok(CreatedPage {
            url: format!("https://notion.example/{page_id}"),
            page_id,
        })
    }

    async fn update_page(
        &self,
        _api_token: &str,
        page_id: &str,
        note: &NoteRecord,
    ) -> Result<UpdatedPage> {
        self.calls.lock().await.push(NotionCall::Update {
            page_id: page_id.to_string(),
            note_id: note.id.clone(),
        });
        let page_id = self.next_page_id(page_id.to_string()).await?;
        Ok(UpdatedPage {
            page_id,
            updated: true,
        })
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    pool: SqlitePool,
    cipher: TokenCipher,
    keep: RecordingKeep,
    notion: RecordingNotion,
    orchestrator: SyncOrchestrator,
}

async fn harness() -> Harness {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let cipher = TokenCipher::new(&vault::generate_key().unwrap()).unwrap();
    let keep = RecordingKeep::default();
    let notion = RecordingNotion::default();
    let orchestrator = SyncOrchestrator::new(
        pool.clone(),
        Arc::new(keep.clone()),
        Arc::new(notion.clone()),
        Arc::new(cipher.clone()),
        Arc::new(Notifier::disabled()),
    );
    Harness {
        pool,
        cipher,
        keep,
        notion,
        orchestrator,
    }
}

async fn seed_credentials(h: &Harness, user_id: &str) {
    let creds = Credentials {
        google_oauth_token: "g-token".into(),
        notion_api_token: "n-token".into(),
        notion_database_id: "db-1".into(),
    };
    db::store_credentials(&h.pool, &h.cipher, user_id, &creds)
        .await
        .unwrap();
}

fn note(id: &str, modified_offset_secs: i64) -> NoteRecord {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    NoteRecord {
        id: id.into(),
        title: format!("Note {id}"),
        content: "body".into(),
        created_at: created,
        modified_at: created + Duration::seconds(modified_offset_secs),
        labels: Vec::new(),
        images: Vec::new(),
    }
}

async fn run(h: &Harness, job_id: Uuid, full_sync: bool) -> keep_sync::model::SyncReport {
    h.orchestrator
        .execute_sync(job_id, "alice", full_sync, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn first_sync_creates_pages_and_state() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    let mut with_images = note("a", 10);
    with_images.images = vec![
        ImageAttachment {
            id: "img-1".into(),
            filename: "receipt.jpg".into(),
            s3_url: Some("https://cdn/receipt.jpg".into()),
        },
        ImageAttachment {
            id: "img-2".into(),
            filename: "torn.jpg".into(),
            s3_url: None,
        },
    ];
    h.keep
        .push_response(Ok(vec![with_images, note("b", 20)]))
        .await;

    let job_id = Uuid::new_v4();
    let report = run(&h, job_id, false).await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.total_notes, 2);
    assert_eq!(report.processed_notes, 2);
    assert_eq!(report.failed_notes, 0);
    assert!(report.error.is_none());

    // No earlier state means the full window goes to the extractor.
    assert_eq!(h.keep.calls().await, vec![(None, None)]);
    assert_eq!(
        h.notion.calls().await,
        vec![
            NotionCall::Create {
                database_id: "db-1".into(),
                note_id: "a".into()
            },
            NotionCall::Create {
                database_id: "db-1".into(),
                note_id: "b".into()
            },
        ]
    );

    let record = db::get_sync_record(&h.pool, "alice", "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.notion_page_id, "page-a");
    assert_eq!(record.keep_modified_at, note("a", 10).modified_at);

    let job = db::get_sync_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    let logs = db::list_sync_logs(&h.pool, job_id, 100).await.unwrap();
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert!(messages.contains(&"Starting sync for user alice"));
    assert!(messages.contains(&"Fetched 2 notes from Keep"));
    assert!(messages.contains(&"Sync completed: 2 processed, 0 failed"));
    let tagged: Vec<_> = logs
        .iter()
        .filter(|l| l.keep_note_id.as_deref() == Some("a"))
        .collect();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].level, LogLevel::Info);
    assert_eq!(
        tagged[0].message,
        "Successfully synced note a to Notion page page-a"
    );
}

#[tokio::test]
async fn second_sync_updates_known_notes_with_incremental_window() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;

    h.keep.push_response(Ok(vec![note("a", 10)])).await;
    run(&h, Uuid::new_v4(), false).await;
    let first_state = db::list_sync_state(&h.pool, "alice").await.unwrap();
    let first_synced_at = first_state[0].last_synced_at;

    h.keep.push_response(Ok(vec![note("a", 500)])).await;
    let report = run(&h, Uuid::new_v4(), false).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.processed_notes, 1);

    let state = db::list_sync_state(&h.pool, "alice").await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].keep_modified_at, note("a", 500).modified_at);

    let calls = h.keep.calls().await;
    assert_eq!(calls.len(), 2);
    // The second run only asks for notes touched since the first run.
    assert_eq!(calls[1].0, Some(first_synced_at));

    let notion_calls = h.notion.calls().await;
    assert_eq!(
        notion_calls[1],
        NotionCall::Update {
            page_id: "page-a".into(),
            note_id: "a".into()
        }
    );
}

#[tokio::test]
async fn full_sync_ignores_the_incremental_window() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;

    h.keep.push_response(Ok(vec![note("a", 10)])).await;
    run(&h, Uuid::new_v4(), false).await;

    h.keep.push_response(Ok(vec![note("a", 10)])).await;
    run(&h, Uuid::new_v4(), true).await;

    let calls = h.keep.calls().await;
    assert_eq!(calls[1], (None, None));
}

#[tokio::test]
async fn note_limit_is_forwarded_to_the_extractor() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    let orchestrator = SyncOrchestrator::new(
        h.pool.clone(),
        Arc::new(h.keep.clone()),
        Arc::new(h.notion.clone()),
        Arc::new(h.cipher.clone()),
        Arc::new(Notifier::disabled()),
    )
    .with_note_limit(Some(25));

    orchestrator
        .execute_sync(Uuid::new_v4(), "alice", false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.keep.calls().await, vec![(None, Some(25))]);
}

#[tokio::test]
async fn failing_note_is_counted_and_the_run_continues() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    h.keep
        .push_response(Ok(vec![note("a", 1), note("b", 2), note("c", 3)]))
        .await;
    h.notion.push_response(Ok("page-a".into())).await;
    h.notion
        .push_response(Err(anyhow!("notion writer error 502 Bad Gateway: upstream")))
        .await;
    h.notion.push_response(Ok("page-c".into())).await;

    let job_id = Uuid::new_v4();
    let report = run(&h, job_id, false).await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.total_notes, 3);
    assert_eq!(report.processed_notes, 2);
    assert_eq!(report.failed_notes, 1);

    assert!(db::get_sync_record(&h.pool, "alice", "a").await.unwrap().is_some());
    assert!(db::get_sync_record(&h.pool, "alice", "b").await.unwrap().is_none());
    assert!(db::get_sync_record(&h.pool, "alice", "c").await.unwrap().is_some());

    let logs = db::list_sync_logs(&h.pool, job_id, 100).await.unwrap();
    let failure: Vec<_> = logs
        .iter()
        .filter(|l| l.level == LogLevel::Error)
        .collect();
    assert_eq!(failure.len(), 1);
    assert_eq!(failure[0].keep_note_id.as_deref(), Some("b"));
    assert!(failure[0].message.starts_with("Failed to process note b:"));
    assert!(failure[0].message.contains("502"));
}

#[tokio::test]
async fn missing_credentials_fail_the_job_before_any_fetch() {
    let h = harness().await;
    let job_id = Uuid::new_v4();
    let report = run(&h, job_id, false).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(
        report.error.as_deref(),
        Some("No credentials found for user alice")
    );
    assert!(h.keep.calls().await.is_empty());
    assert!(h.notion.calls().await.is_empty());

    let job = db::get_sync_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completed_at.is_some());

    let logs = db::list_sync_logs(&h.pool, job_id, 100).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Error
            && l.message == "No credentials found for user alice"));
}

#[tokio::test]
async fn fetch_failure_fails_the_whole_job() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    h.keep
        .push_response(Err(anyhow!("keep extractor error 500: boom")))
        .await;

    let job_id = Uuid::new_v4();
    let report = run(&h, job_id, false).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.total_notes, 0);
    let error = report.error.unwrap();
    assert!(error.contains("failed to fetch notes from Keep"));
    assert!(error.contains("boom"));
    assert!(h.notion.calls().await.is_empty());
}

#[tokio::test]
async fn empty_fetch_completes_with_zero_counts() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    h.keep.push_response(Ok(Vec::new())).await;

    let job_id = Uuid::new_v4();
    let report = run(&h, job_id, false).await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        (report.total_notes, report.processed_notes, report.failed_notes),
        (0, 0, 0)
    );
    assert!(h.notion.calls().await.is_empty());

    let logs = db::list_sync_logs(&h.pool, job_id, 100).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "Fetched 0 notes from Keep"));
}

#[tokio::test]
async fn cancellation_is_observed_between_notes() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;
    h.keep
        .push_response(Ok(vec![note("a", 1), note("b", 2), note("c", 3)]))
        .await;

    let token = CancellationToken::new();
    h.notion.cancel_during_calls(token.clone()).await;

    let job_id = Uuid::new_v4();
    let report = h
        .orchestrator
        .execute_sync(job_id, "alice", false, token)
        .await
        .unwrap();

    // The first note finishes, then the loop sees the cancelled token.
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.total_notes, 3);
    assert_eq!(report.processed_notes, 1);
    assert_eq!(report.failed_notes, 0);
    assert_eq!(report.error.as_deref(), Some("Job cancelled by user"));
    assert_eq!(h.notion.calls().await.len(), 1);

    let job = db::get_sync_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    let logs = db::list_sync_logs(&h.pool, job_id, 100).await.unwrap();
    assert!(logs.iter().any(|l| l.level == LogLevel::Warning
        && l.message == "Sync stopped after cancellation: 1 processed, 0 failed"));
}

#[tokio::test]
async fn job_cancelled_while_queued_never_runs() {
    let h = harness().await;
    seed_credentials(&h, "alice").await;

    let job_id = Uuid::new_v4();
    db::create_sync_job(&h.pool, job_id, "alice", false).await.unwrap();
    db::finalize_sync_job(&h.pool, job_id, JobStatus::Cancelled, Some("Job cancelled by user"))
        .await
        .unwrap();

    let report = run(&h, job_id, false).await;
    assert_eq!(report.status, JobStatus::Cancelled);
    assert!(h.keep.calls().await.is_empty());
}
