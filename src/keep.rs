//! HTTP adapter for the Keep extractor service.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::model::NoteRecord;

#[derive(Clone)]
pub struct KeepClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for KeepClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Seam for the extractor so sync runs can be driven against a test double.
#[async_trait]
pub trait KeepService: Send + Sync {
    /// Authenticate and pull the user's notes, newest window first applied
    /// server-side via `modified_since`.
    async fn fetch_notes(
        &self,
        username: &str,
        google_token: &str,
        modified_since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<NoteRecord>>;

    async fn health(&self) -> Result<()>;
}

impl KeepClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid Keep extractor URL {base_url}"))?;
        let http = Client::builder()
            .user_agent("keep-sync/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build Keep extractor client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_notes_request(
        &self,
        username: &str,
        modified_since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("internal/keep/notes")
            .context("invalid Keep extractor URL")?;
        let mut query: Vec<(&str, String)> = vec![
            ("username", username.to_string()),
            ("upload_images", "true".to_string()),
        ];
        if let Some(since) = modified_since {
            query.push(("modified_since", since.to_rfc3339()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.http
            .get(endpoint)
            .query(&query)
            .build()
            .context("failed to build Keep notes request")
    }

    /// The body carries the master token, so it is never logged.
    async fn authenticate(&self, username: &str, google_token: &str) -> Result<()> {
        let endpoint = self
            .base_url
            .join("internal/keep/auth")
            .context("invalid Keep extractor URL")?;
        let body = build_auth_body(username, google_token);
        let res = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .context("failed to reach Keep extractor")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Keep extractor auth error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("keep extractor auth error {}: {}", status, body));
        }

        let payload: AuthResponse = res
            .json()
            .await
            .context("invalid Keep extractor auth response")?;
        if payload.status != "authenticated" {
            return Err(anyhow!(
                "keep authentication rejected for {}: {}",
                username,
                payload.error.unwrap_or_else(|| payload.status.clone())
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeepService for KeepClient {
    async fn fetch_notes(
        &self,
        username: &str,
        google_token: &str,
        modified_since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<NoteRecord>> {
        self.authenticate(username, google_token).await?;

        let request = self.build_notes_request(username, modified_since, limit)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Keep extractor")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Keep extractor error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("keep extractor error {}: {}", status, body));
        }

        let payload: NotesResponse = res
            .json()
            .await
            .context("invalid Keep extractor notes response")?;
        info!(count = payload.notes.len(), "fetched notes from Keep extractor");
        Ok(payload.notes)
    }

    async fn health(&self) -> Result<()> {
        let endpoint = self
            .base_url
            .join("health")
            .context("invalid Keep extractor URL")?;
        let res = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("failed to reach Keep extractor")?;
        if !res.status().is_success() {
            return Err(anyhow!("keep extractor unhealthy: {}", res.status()));
        }
        Ok(())
    }
}

pub fn build_auth_body(username: &str, google_token: &str) -> Value {
    json!({
        "username": username,
        "master_token": google_token,
    })
}

#[derive(Deserialize)]
struct AuthResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct NotesResponse {
    notes: Vec<NoteRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_client() -> KeepClient {
        KeepClient::new("http://127.0.0.1:8003", Duration::from_secs(5)).unwrap()
    }

    fn query_value(request: &reqwest::Request, key: &str) -> Option<String> {
        request
            .url()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn build_auth_body_carries_both_fields() {
        let body = build_auth_body("alice", "aas_et/secret");
        assert_eq!(body["username"], "alice");
        assert_eq!(body["master_token"], "aas_et/secret");
    }

    #[test]
    fn build_notes_request_sets_window_and_limit() {
        let client = sample_client();
        let since = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap();
        let request = client
            .build_notes_request("alice", Some(since), Some(50))
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/internal/keep/notes");
        assert_eq!(query_value(&request, "username").as_deref(), Some("alice"));
        assert_eq!(
            query_value(&request, "upload_images").as_deref(),
            Some("true")
        );
        assert_eq!(
            query_value(&request, "modified_since").as_deref(),
            Some("2024-05-02T09:30:00+00:00")
        );
        assert_eq!(query_value(&request, "limit").as_deref(), Some("50"));
    }

    #[test]
    fn build_notes_request_omits_missing_window() {
        let client = sample_client();
        let request = client.build_notes_request("alice", None, None).unwrap();
        assert!(query_value(&request, "modified_since").is_none());
        assert!(query_value(&request, "limit").is_none());
        assert_eq!(query_value(&request, "username").as_deref(), Some("alice"));
    }

    #[test]
    fn rejects_malformed_base_url() {
        assert!(KeepClient::new("not a url", Duration::from_secs(5)).is_err());
    }
}
