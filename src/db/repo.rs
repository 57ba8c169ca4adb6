use crate::model::{Credentials, JobStatus, LogLevel, SyncJob, SyncLogEntry, SyncStateRecord};
use crate::vault::TokenCipher;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database at {normalized}"))?;
    // WAL for concurrent readers, full fsync on commit.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Normalize a file-backed SQLite URL: expand a leading `~/`, create the
/// parent directory, and request read-write-create mode so the database file
/// appears on first run. In-memory and non-sqlite URLs pass through as-is.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    // sqlite::memory: and friends need no filesystem setup.
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    // ~/ paths resolve against HOME.
    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Reassemble in the explicit sqlite:// form, asking for create mode
    // unless the caller already picked one.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run migrations")?;
    Ok(())
}

/// Insert a job row in `queued` state. Replaying an id is a no-op so a retried
/// submission cannot clobber a run already in flight.
#[instrument(skip_all)]
pub async fn create_sync_job(
    pool: &Pool,
    job_id: Uuid,
    user_id: &str,
    full_sync: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_jobs (job_id, user_id, status, full_sync) VALUES (?, ?, 'queued', ?) \
         ON CONFLICT(job_id) DO NOTHING",
    )
    .bind(job_id.to_string())
    .bind(user_id)
    .bind(full_sync)
    .execute(pool)
    .await
    .context("failed to create sync job")?;
    Ok(())
}

/// Flip a queued job to `running`. Returns false when the job was cancelled
/// before it was ever picked up.
#[instrument(skip_all)]
pub async fn start_sync_job(pool: &Pool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sync_jobs SET status = 'running' WHERE job_id = ? AND status = 'queued'",
    )
    .bind(job_id.to_string())
    .execute(pool)
    .await
    .context("failed to start sync job")?;
    Ok(result.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn set_sync_job_total(pool: &Pool, job_id: Uuid, total: i64) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET total_notes = ? WHERE job_id = ?")
        .bind(total)
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn increment_sync_job_progress(
    pool: &Pool,
    job_id: Uuid,
    processed: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET processed_notes = processed_notes + ?, failed_notes = failed_notes + ? \
         WHERE job_id = ?",
    )
    .bind(processed)
    .bind(failed)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Move a live job to a terminal state. Returns false when another writer
/// already finished the job, so a job reaches a terminal state exactly once.
#[instrument(skip_all)]
pub async fn finalize_sync_job(
    pool: &Pool,
    job_id: Uuid,
    status: JobStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let result = sqlx::query(
        "UPDATE sync_jobs SET status = ?, error_message = ?, completed_at = ? \
         WHERE job_id = ? AND status IN ('queued', 'running')",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await
    .context("failed to finalize sync job")?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_sync_job(pool: &Pool, job_id: Uuid) -> Result<Option<SyncJob>> {
    let row = sqlx::query(
        "SELECT job_id, user_id, status, full_sync, total_notes, processed_notes, failed_notes, \
                error_message, created_at, completed_at \
         FROM sync_jobs WHERE job_id = ?",
    )
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(map_job_row).transpose()
}

pub async fn list_sync_jobs(
    pool: &Pool,
    user_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(
        "SELECT job_id, user_id, status, full_sync, total_notes, processed_notes, failed_notes, \
                error_message, created_at, completed_at \
         FROM sync_jobs WHERE user_id = ? \
         ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(map_job_row).collect()
}

fn map_job_row(row: sqlx::sqlite::SqliteRow) -> Result<SyncJob> {
    let raw_id: String = row.get("job_id");
    let job_id: Uuid = raw_id
        .parse()
        .with_context(|| format!("sync job row has malformed id {raw_id}"))?;
    let status: String = row.get("status");
    let status = JobStatus::parse(&status)
        .ok_or_else(|| anyhow!("sync job {} has unknown status {}", job_id, status))?;
    Ok(SyncJob {
        job_id,
        user_id: row.get("user_id"),
        status,
        full_sync: row.get("full_sync"),
        total_notes: row.get("total_notes"),
        processed_notes: row.get("processed_notes"),
        failed_notes: row.get("failed_notes"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

/// Tokens are sealed with the vault cipher before they touch the database.
#[instrument(skip_all)]
pub async fn store_credentials(
    pool: &Pool,
    cipher: &TokenCipher,
    user_id: &str,
    creds: &Credentials,
) -> Result<()> {
    let google_token = cipher.encrypt(&creds.google_oauth_token)?;
    let notion_token = cipher.encrypt(&creds.notion_api_token)?;
    sqlx::query(
        "INSERT INTO credentials (user_id, google_oauth_token, notion_api_token, notion_database_id, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET \
             google_oauth_token = excluded.google_oauth_token, \
             notion_api_token = excluded.notion_api_token, \
             notion_database_id = excluded.notion_database_id, \
             updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(google_token)
    .bind(notion_token)
    .bind(&creds.notion_database_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to store credentials")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_credentials(
    pool: &Pool,
    cipher: &TokenCipher,
    user_id: &str,
) -> Result<Option<Credentials>> {
    let row = sqlx::query(
        "SELECT google_oauth_token, notion_api_token, notion_database_id \
         FROM credentials WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let google_token: String = row.get("google_oauth_token");
    let notion_token: String = row.get("notion_api_token");
    Ok(Some(Credentials {
        google_oauth_token: cipher
            .decrypt(&google_token)
            .context("failed to decrypt google token")?,
        notion_api_token: cipher
            .decrypt(&notion_token)
            .context("failed to decrypt notion token")?,
        notion_database_id: row.get("notion_database_id"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_credentials(pool: &Pool, user_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM credentials WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_sync_state(pool: &Pool, user_id: &str) -> Result<Vec<SyncStateRecord>> {
    let rows = sqlx::query(
        "SELECT id, user_id, keep_note_id, notion_page_id, last_synced_at, keep_modified_at \
         FROM sync_state WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(map_state_row).collect())
}

pub async fn get_sync_record(
    pool: &Pool,
    user_id: &str,
    keep_note_id: &str,
) -> Result<Option<SyncStateRecord>> {
    let row = sqlx::query(
        "SELECT id, user_id, keep_note_id, notion_page_id, last_synced_at, keep_modified_at \
         FROM sync_state WHERE user_id = ? AND keep_note_id = ?",
    )
    .bind(user_id)
    .bind(keep_note_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(map_state_row))
}

fn map_state_row(row: sqlx::sqlite::SqliteRow) -> SyncStateRecord {
    SyncStateRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        keep_note_id: row.get("keep_note_id"),
        notion_page_id: row.get("notion_page_id"),
        last_synced_at: row.get("last_synced_at"),
        keep_modified_at: row.get("keep_modified_at"),
    }
}

#[instrument(skip_all)]
pub async fn upsert_sync_state(
    pool: &Pool,
    user_id: &str,
    keep_note_id: &str,
    notion_page_id: &str,
    keep_modified_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (user_id, keep_note_id, notion_page_id, last_synced_at, keep_modified_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, keep_note_id) DO UPDATE SET \
             notion_page_id = excluded.notion_page_id, \
             last_synced_at = excluded.last_synced_at, \
             keep_modified_at = excluded.keep_modified_at",
    )
    .bind(user_id)
    .bind(keep_note_id)
    .bind(notion_page_id)
    .bind(Utc::now())
    .bind(keep_modified_at)
    .execute(pool)
    .await
    .context("failed to record sync state")?;
    Ok(())
}

/// Drop the mapping for one note, or every mapping for the user when
/// `keep_note_id` is None. Returns how many rows went away.
#[instrument(skip_all)]
pub async fn delete_sync_state(
    pool: &Pool,
    user_id: &str,
    keep_note_id: Option<&str>,
) -> Result<u64> {
    let result = match keep_note_id {
        Some(note_id) => {
            sqlx::query("DELETE FROM sync_state WHERE user_id = ? AND keep_note_id = ?")
                .bind(user_id)
                .bind(note_id)
                .execute(pool)
                .await?
        }
        None => {
            sqlx::query("DELETE FROM sync_state WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await?
        }
    };
    Ok(result.rows_affected())
}

#[instrument(skip_all)]
pub async fn add_sync_log(
    pool: &Pool,
    job_id: Uuid,
    keep_note_id: Option<&str>,
    level: LogLevel,
    message: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_logs (job_id, keep_note_id, level, message) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(job_id.to_string())
    .bind(keep_note_id)
    .bind(level.as_str())
    .bind(message)
    .fetch_one(pool)
    .await
    .context("failed to append sync log")?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn list_sync_logs(pool: &Pool, job_id: Uuid, limit: i64) -> Result<Vec<SyncLogEntry>> {
    let rows = sqlx::query(
        "SELECT id, job_id, keep_note_id, level, message, created_at \
         FROM sync_logs WHERE job_id = ? \
         ORDER BY created_at ASC, id ASC LIMIT ?",
    )
    .bind(job_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(map_log_row).collect()
}

fn map_log_row(row: sqlx::sqlite::SqliteRow) -> Result<SyncLogEntry> {
    let level: String = row.get("level");
    let id: i64 = row.get("id");
    let level = LogLevel::parse(&level)
        .ok_or_else(|| anyhow!("sync log {} has unknown level {}", id, level))?;
    let raw_job: String = row.get("job_id");
    let job_id: Uuid = raw_job
        .parse()
        .with_context(|| format!("sync log {id} has malformed job id {raw_job}"))?;
    Ok(SyncLogEntry {
        id,
        job_id,
        keep_note_id: row.get("keep_note_id"),
        level,
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}
