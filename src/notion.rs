//! HTTP adapter for the Notion writer service.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::model::NoteRecord;

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedPage {
    pub page_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdatedPage {
    pub page_id: String,
    pub updated: bool,
}

/// Seam for the writer so sync runs can be driven against a test double.
#[async_trait]
pub trait NotionService: Send + Sync {
    async fn create_page(
        &self,
        api_token: &str,
        database_id: &str,
        note: &NoteRecord,
    ) -> Result<CreatedPage>;

    async fn update_page(
        &self,
        api_token: &str,
        page_id: &str,
        note: &NoteRecord,
    ) -> Result<UpdatedPage>;

    async fn health(&self) -> Result<()>;
}

impl NotionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid Notion writer URL {base_url}"))?;
        let http = Client::builder()
            .user_agent("keep-sync/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build Notion writer client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_create_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("internal/notion/pages")
            .context("invalid Notion writer URL")?;
        self.http
            .post(endpoint)
            .json(body)
            .build()
            .context("failed to build Notion create request")
    }

    pub fn build_update_request(&self, page_id: &str, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("internal/notion/pages/{page_id}"))
            .context("invalid Notion writer URL")?;
        self.http
            .patch(endpoint)
            .json(body)
            .build()
            .context("failed to build Notion update request")
    }
}

#[async_trait]
impl NotionService for NotionClient {
    async fn create_page(
        &self,
        api_token: &str,
        database_id: &str,
        note: &NoteRecord,
    ) -> Result<CreatedPage> {
        // The body carries the API token, so it is never logged.
        let body = build_create_request_body(api_token, database_id, note);
        let request = self.build_create_request(&body)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Notion writer")?;

        // Anything but 201 means the page did not come into existence.
        if res.status() != StatusCode::CREATED {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Notion writer error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("notion writer error {}: {}", status, body));
        }
        res.json::<CreatedPage>()
            .await
            .context("invalid Notion writer create response")
    }

    async fn update_page(
        &self,
        api_token: &str,
        page_id: &str,
        note: &NoteRecord,
    ) -> Result<UpdatedPage> {
        let body = build_update_request_body(api_token, note);
        let request = self.build_update_request(page_id, &body)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Notion writer")?;

        if res.status() != StatusCode::OK {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Notion writer error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("notion writer error {}: {}", status, body));
        }
        res.json::<UpdatedPage>()
            .await
            .context("invalid Notion writer update response")
    }

    async fn health(&self) -> Result<()> {
        let endpoint = self
            .base_url
            .join("health")
            .context("invalid Notion writer URL")?;
        let res = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("failed to reach Notion writer")?;
        if !res.status().is_success() {
            return Err(anyhow!("notion writer unhealthy: {}", res.status()));
        }
        Ok(())
    }
}

pub fn build_create_request_body(api_token: &str, database_id: &str, note: &NoteRecord) -> Value {
    json!({
        "api_token": api_token,
        "database_id": database_id,
        "note": note,
    })
}

pub fn build_update_request_body(api_token: &str, note: &NoteRecord) -> Value {
    json!({
        "api_token": api_token,
        "note": note,
    })
}
