use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a sync job. A job leaves `Queued`/`Running` exactly
/// once, into one of the three terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job log line, stored uppercase like the rest of the stack
/// expects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(LogLevel::Info),
            "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One note as returned by the Keep extractor and forwarded to the Notion
/// writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

/// Image metadata attached to a note. `s3_url` is null when the extractor
/// could not upload the blob; such notes fail per-note at the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub s3_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    pub full_sync: bool,
    pub total_notes: i64,
    pub processed_notes: i64,
    pub failed_notes: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable mapping of one Keep note to its Notion page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub id: i64,
    pub user_id: String,
    pub keep_note_id: String,
    pub notion_page_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub keep_modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub keep_note_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Decrypted credential bundle for one user.
#[derive(Clone)]
pub struct Credentials {
    pub google_oauth_token: String,
    pub notion_api_token: String,
    pub notion_database_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("notion_database_id", &self.notion_database_id)
            .finish_non_exhaustive()
    }
}

/// Terminal summary of one sync run, mirroring the job row.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_notes: i64,
    pub processed_notes: i64,
    pub failed_notes: i64,
    pub error: Option<String>,
}
