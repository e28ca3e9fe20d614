//! OpenAPI document download with a bounded retry schedule

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use apim_common::crd::HttpUrl;
use apim_common::retry::BackoffSchedule;
use apim_common::Error;

/// Downloads one document per call
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// GET `url`, bounded by `timeout`. Non-2xx is an error.
    async fn fetch(&self, url: &HttpUrl, timeout: Duration) -> Result<Vec<u8>, Error>;
}

/// [`DocumentFetcher`] over reqwest
pub struct HttpDocumentFetcher {
    http: reqwest::Client,
}

impl HttpDocumentFetcher {
    /// Build the fetcher
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::internal_with_context("HttpDocumentFetcher", e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch(&self, url: &HttpUrl, timeout: Duration) -> Result<Vec<u8>, Error> {
        let resp = self
            .http
            .get(url.as_url().clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::fetch(url.as_str(), e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::fetch(url.as_str(), format!("HTTP {status}")));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::fetch(url.as_str(), format!("reading body: {e}")))?;
        Ok(body.to_vec())
    }
}

/// How hard to try before giving up on a document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Attempts before the fetch is reported as failed
    pub attempts: u32,
    /// Delay after the first failure, doubled after each subsequent one
    pub base_delay: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetch `url`, sleeping 2, 4, 8, ... after each failure (with the default
/// policy) and returning the last error once every attempt has failed.
pub async fn fetch_with_retry(
    fetcher: &dyn DocumentFetcher,
    url: &HttpUrl,
    policy: &FetchPolicy,
) -> Result<Vec<u8>, Error> {
    let schedule = BackoffSchedule::doubling(policy.attempts, policy.base_delay);
    let mut last_error = None;

    for (attempt, delay) in schedule.delays().enumerate() {
        match fetcher.fetch(url, policy.attempt_timeout).await {
            Ok(document) => {
                debug!(
                    url = %url,
                    attempt = attempt + 1,
                    bytes = document.len(),
                    "Fetched OpenAPI document"
                );
                return Ok(document);
            }
            Err(e) => {
                warn!(
                    url = %url,
                    attempt = attempt + 1,
                    max_attempts = schedule.attempts(),
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "OpenAPI document fetch failed"
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::fetch(url.as_str(), "no fetch attempts configured")))
}
