//! Rate limiting and retry logic for remote catalogue calls
//!
//! Each remote gets its own token bucket. Callers block in [`RateLimiter::wait`]
//! until a token is free; the wait itself is not cancellable, so grouped tasks
//! check their cancellation token before calling in.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, Response};
use tracing::{debug, warn};

/// Token bucket parameters: `capacity` tokens refilled over `period`
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub period: Duration,
}

impl RateLimitConfig {
    /// 90 requests per minute
    pub fn catalogue() -> Self {
        Self {
            capacity: 90,
            period: Duration::from_secs(60),
        }
    }

    /// 20 requests per second
    pub fn episode_db() -> Self {
        Self {
            capacity: 20,
            period: Duration::from_secs(1),
        }
    }

    fn quota(&self) -> Quota {
        let capacity = NonZeroU32::new(self.capacity).unwrap_or(NonZeroU32::MIN);
        let replenish = self.period / capacity.get();
        Quota::with_period(replenish)
            .map(|q| q.allow_burst(capacity))
            .unwrap_or_else(|| Quota::per_second(capacity))
    }
}

/// Shared token bucket for one logical remote
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: &'static str,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(governor::RateLimiter::direct(config.quota())),
            name,
        }
    }

    pub fn for_catalogue() -> Self {
        Self::new("catalogue", RateLimitConfig::catalogue())
    }

    pub fn for_episode_db() -> Self {
        Self::new("episode_db", RateLimitConfig::episode_db())
    }

    /// Block until a token is available
    pub async fn wait(&self) {
        if self.inner.check().is_err() {
            debug!(limiter = self.name, "Rate limit reached, waiting for a token");
            self.inner.until_ready().await;
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A rate-limited HTTP client wrapper
#[derive(Clone)]
pub struct RateLimitedClient {
    client: Client,
    limiter: RateLimiter,
}

impl RateLimitedClient {
    pub fn new(limiter: RateLimiter) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, limiter })
    }

    /// Wait for rate limit and make a GET request with query parameters
    pub async fn get_with_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        query: &T,
    ) -> Result<Response> {
        self.limiter.wait().await;
        debug!(client = self.limiter.name(), url = %url, "Making rate-limited GET request");

        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .context("HTTP request failed")
    }

    /// Wait for rate limit and POST a JSON body, optionally with a bearer token
    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> Result<Response> {
        self.limiter.wait().await;
        debug!(client = self.limiter.name(), url = %url, "Making rate-limited POST request");

        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        request.send().await.context("HTTP request failed")
    }

    /// Underlying client for requests that manage their own limiting
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }
}

/// Execute an async operation with retry logic
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = %operation_name,
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = duration.as_millis() as u64,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

/// Helper trait for classifying HTTP responses
pub trait ResponseExt {
    fn is_rate_limited(&self) -> bool;
    fn is_transient_error(&self) -> bool;
}

impl ResponseExt for Response {
    fn is_rate_limited(&self) -> bool {
        self.status().as_u16() == 429
    }

    fn is_transient_error(&self) -> bool {
        let status = self.status().as_u16();
        status == 429 || status == 408 || (500..600).contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_bucket_allows_full_burst() {
        let limiter = RateLimiter::for_catalogue();
        for _ in 0..90 {
            assert!(limiter.inner.check().is_ok());
        }
        assert!(limiter.inner.check().is_err());
    }

    #[test]
    fn test_episode_db_bucket_capacity() {
        let limiter = RateLimiter::for_episode_db();
        let granted = (0..25).filter(|_| limiter.inner.check().is_ok()).count();
        assert_eq!(granted, 20);
    }

    #[tokio::test]
    async fn test_wait_returns_once_token_refills() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitConfig {
                capacity: 2,
                period: Duration::from_millis(100),
            },
        );
        limiter.wait().await;
        limiter.wait().await;
        let started = std::time::Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_retry_async_gives_up_after_max_retries() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            multiplier: 1.0,
        };
        let result: Result<(), String> = retry_async(
            || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err("boom".to_string()) }
            },
            &config,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
