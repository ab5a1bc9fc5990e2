use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    models::{response::ApiResponse, retry::RetryConfig},
    utils::retry_with_backoff,
};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Breaker-guarded, retried GET against a collaborator that wraps its payload
/// in the `ApiResponse` envelope. A 404 is `Ok(None)` and does not count as a
/// dependency failure.
#[derive(Clone)]
pub struct LookupClient {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl LookupClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        retry_config: RetryConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_config,
            circuit_breaker,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_optional<T>(&self, path: &str, correlation_id: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, correlation_id, "Fetching from collaborator");

        self.circuit_breaker
            .execute(|| {
                retry_with_backoff(&self.retry_config, || {
                    self.get_once::<T>(&url, correlation_id)
                })
            })
            .await
            .map_err(|e| anyhow!("{}", e))
    }

    async fn get_once<T>(&self, url: &str, correlation_id: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http_client
            .get(url)
            .header(CORRELATION_HEADER, correlation_id)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            return Err(anyhow!("{} returned status {}", url, status));
        }

        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse response from {}: {}", url, e))?;

        if !body.success {
            return Err(anyhow!(
                "{} reported failure: {}",
                url,
                body.error.unwrap_or(body.message)
            ));
        }

        Ok(body.data)
    }
}
