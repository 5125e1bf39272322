//! HTTP client for the lease controller.
//!
//! Transient failures (connection errors, unexpected statuses) are retried
//! with a fixed delay up to a bounded number of attempts. A `409` is a
//! non-retriable lease conflict and is returned immediately.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::handlers::{ApiError, ReleaseRequest};
use crate::error::LeaseError;
use crate::lease::{AcquireRequest, Lease, LeaseList};

const TIMEOUT_SECS: u64 = 10;
const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Lease operations as seen from a daemon.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn acquire(&self, underlay_ip: &str, single_ip: bool) -> Result<Lease, LeaseError>;

    async fn renew(&self, lease: &Lease) -> Result<(), LeaseError>;

    async fn release(&self, underlay_ip: &str) -> Result<(), LeaseError>;

    async fn list(&self) -> Result<Vec<Lease>, LeaseError>;
}

/// [`LeaseClient`] over HTTP/JSON.
pub struct HttpLeaseClient {
    client: Client,
    base_url: String,
    attempts: u32,
    retry_delay: Duration,
}

impl HttpLeaseClient {
    pub fn new(base_url: &str) -> Result<Self, LeaseError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("weftnet/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LeaseError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        })
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Send the request built by `build`, retrying transient failures.
    async fn send_with_retry<T, F>(&self, url: &str, build: F) -> Result<T, LeaseError>
    where
        T: DeserializeOwned + Send,
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut last = String::new();

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                debug!("Retry {} after {:?} for {}", attempt - 1, self.retry_delay, url);
                tokio::time::sleep(self.retry_delay).await;
            }
            match build().send().await {
                Ok(response) => match decode(response).await {
                    Ok(value) => return Ok(value),
                    Err(err @ LeaseError::NonRetriable(_)) => return Err(err),
                    Err(err) => last = err.to_string(),
                },
                Err(e) => last = e.to_string(),
            }
            warn!("Attempt {}/{} for {} failed: {}", attempt, self.attempts, url, last);
        }

        Err(LeaseError::Exhausted {
            attempts: self.attempts,
            last,
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, LeaseError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        self.send_with_retry(&url, || self.client.post(&url).json(body))
            .await
    }

    async fn get<T: DeserializeOwned + Send>(&self, path: &str) -> Result<T, LeaseError> {
        let url = format!("{}{}", self.base_url, path);
        self.send_with_retry(&url, || self.client.get(&url)).await
    }
}

/// Turn a response into a value or a classified error.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, LeaseError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LeaseError::Transport(e.to_string()))?;

    if status == StatusCode::CONFLICT {
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        return Err(LeaseError::NonRetriable(message));
    }
    if !status.is_success() {
        return Err(LeaseError::Transport(format!(
            "unexpected status code: {}: {}",
            status.as_u16(),
            body.trim()
        )));
    }
    serde_json::from_str(&body)
        .map_err(|e| LeaseError::Transport(format!("decode response: {}", e)))
}

#[async_trait]
impl LeaseClient for HttpLeaseClient {
    async fn acquire(&self, underlay_ip: &str, single_ip: bool) -> Result<Lease, LeaseError> {
        let request = AcquireRequest {
            underlay_ip: underlay_ip.to_string(),
            single_overlay_ip: single_ip,
        };
        self.post("/leases/acquire", &request).await
    }

    async fn renew(&self, lease: &Lease) -> Result<(), LeaseError> {
        let _: serde_json::Value = self.post("/leases/renew", lease).await?;
        Ok(())
    }

    async fn release(&self, underlay_ip: &str) -> Result<(), LeaseError> {
        let request = ReleaseRequest {
            underlay_ip: underlay_ip.to_string(),
        };
        let _: serde_json::Value = self.post("/leases/release", &request).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Lease>, LeaseError> {
        let list: LeaseList = self.get("/leases").await?;
        Ok(list.leases)
    }
}
