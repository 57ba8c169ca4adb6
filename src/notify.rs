//! Best-effort webhook notifications for sync failures.
//!
//! Delivery is advisory. A run never fails because a webhook was down, so
//! every error path here ends in a `warn!` instead of propagating.

use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;

#[derive(Clone)]
pub struct Notifier {
    http: Client,
    enabled: bool,
    webhook_url: Option<Url>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn from_config(cfg: &config::Notifications) -> Self {
        let webhook_url = cfg
            .webhook_url
            .as_deref()
            .and_then(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(%err, "ignoring malformed webhook URL");
                    None
                }
            });
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            enabled: cfg.enabled && webhook_url.is_some(),
            webhook_url,
        }
    }

    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            enabled: false,
            webhook_url: None,
        }
    }

    /// Report a failure that ended a sync job. `context` names the stage the
    /// job died in.
    pub async fn critical_error(&self, job_id: Uuid, user_id: &str, error: &str, context: Value) {
        warn!(%job_id, user_id, error, "critical sync error");
        if !self.enabled {
            info!("notifications disabled, skipping webhook delivery");
            return;
        }
        let Some(url) = self.webhook_url.clone() else {
            return;
        };

        let text = format!(
            "Critical Error in Sync Job\nJob ID: {job_id}\nUser ID: {user_id}\nError: {error}\nContext: {context}"
        );
        let payload = json!({
            "text": text,
            "job_id": job_id,
            "user_id": user_id,
            "error": error,
        });

        let delivery = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .and_then(|res| res.error_for_status());
        if let Err(err) = delivery {
            warn!(%job_id, %err, "failed to deliver critical error notification");
        }
    }
}
