use std::time::Duration;

use tracing::warn;

use revclock_core::{HttpMethod, MutationKind, SyncQueueItem};

use crate::error::ApiError;
use crate::types::{CreateSessionResponse, HealthResponse};

/// Outcome of a successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Remote-assigned session id, present on create-session acknowledgments.
    pub remote_id: Option<String>,
}

/// Typed HTTP client for the remote authority.
///
/// One bounded timeout per attempt; there is no in-client retry. Retry pacing
/// belongs to the dispatcher, which owns the durable attempt counters.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn set_auth(&mut self, token: String) {
        self.auth_token = Some(token);
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        let resp = self.client.get(self.url("/health")).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(resp.json().await?)
    }

    /// Delivers one queued mutation. On success, create-session mutations
    /// yield the remote-assigned id in the acknowledgment.
    pub async fn deliver(&self, item: &SyncQueueItem) -> Result<DeliveryAck, ApiError> {
        let url = self.url(&item.endpoint);
        let mut req = match item.method {
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Put => self.client.put(&url),
        };
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.json(&item.body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        if item.kind == MutationKind::CreateSession {
            match resp.json::<CreateSessionResponse>().await {
                Ok(ack) => {
                    return Ok(DeliveryAck {
                        remote_id: Some(ack.id),
                    });
                }
                Err(e) => {
                    // The mutation landed; a malformed ack only costs us the
                    // remote id mapping.
                    warn!("create acknowledged but response unparseable: {e}");
                }
            }
        }
        Ok(DeliveryAck::default())
    }
}
