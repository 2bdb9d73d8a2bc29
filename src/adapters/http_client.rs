//! HTTP plumbing shared by the adapters.
//!
//! Each adapter owns one [`HttpClient`], so the minimum request interval is
//! enforced per source. Transient failures (HTTP 429, 5xx, network errors)
//! are retried here with a short policy from `[http]`; anything that
//! survives that is returned to the orchestrator, which applies its own
//! retry budget.

use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;

use crate::config::HttpConfig;
use crate::error::FetchError;
use crate::retry::{retry_with_backoff, RetryPolicy};

const MAX_ERROR_BODY: usize = 512;

/// One request per `min_interval`, no burst. A zero interval disables
/// limiting.
fn rate_limiter(min_interval: Duration) -> Option<DefaultDirectRateLimiter> {
    Quota::with_period(min_interval).map(RateLimiter::direct)
}

pub struct HttpClient {
    client: reqwest::Client,
    limiter: Option<DefaultDirectRateLimiter>,
    retry: RetryPolicy,
    bearer_token: Option<String>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig, bearer_token: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            limiter: rate_limiter(Duration::from_millis(config.min_interval_ms)),
            retry: config.retry_policy(),
            bearer_token,
        })
    }

    /// GET a JSON document; 404 is an error.
    pub async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        match self.get_json_optional(url).await? {
            Some(value) => Ok(value),
            None => Err(FetchError::Http {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: url.to_string(),
                body: String::new(),
            }),
        }
    }

    /// GET a JSON document; 404 yields `None`.
    pub async fn get_json_optional(&self, url: &str) -> Result<Option<Value>, FetchError> {
        let Some(body) = self.get(url, "application/json").await? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| FetchError::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<Option<String>, FetchError> {
        retry_with_backoff(&self.retry, "http_get", |_| self.get_once(url, accept))
            .await
            .map_err(|e| e.into_inner())
    }

    async fn get_once(&self, url: &str, accept: &str) -> Result<Option<String>, FetchError> {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }

        let mut request = self.client.get(url).header(ACCEPT, accept);
        if let Some(ref token) = self.bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }

        Ok(Some(response.text().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_zero_interval_disables_limiting() {
        assert!(rate_limiter(Duration::ZERO).is_none());
        assert!(rate_limiter(Duration::from_millis(1)).is_some());
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = rate_limiter(Duration::from_millis(100)).unwrap();
        let start = Instant::now();
        limiter.until_ready().await;
        limiter.until_ready().await;
        limiter.until_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(180), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_rate_limiter_no_wait_after_idle() {
        let limiter = rate_limiter(Duration::from_millis(100)).unwrap();
        limiter.until_ready().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let start = Instant::now();
        limiter.until_ready().await;
        assert!(start.elapsed() < Duration::from_millis(50), "{:?}", start.elapsed());
    }
}
