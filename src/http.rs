//! Outbound HTTP with retries.
//!
//! Connection failures, timeouts, `429` and `5xx` responses are retried with
//! exponential backoff (doubling from `initial_backoff`, capped at
//! `max_backoff`). A `Retry-After` header in seconds is honoured up to the cap.

use reqwest::{header::RETRY_AFTER, Request, RequestBuilder, Response, StatusCode};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// A `reqwest::Client` that retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryClient {
    inner: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryClient {
    pub fn new(policy: RetryPolicy) -> reqwest::Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("mars/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { inner, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.inner.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.inner.post(url)
    }

    pub async fn send(&self, request: RequestBuilder) -> reqwest::Result<Response> {
        self.execute(request.build()?).await
    }

    pub async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        let mut attempt = 0;
        loop {
            // Streaming bodies cannot be replayed, so they get a single try
            let Some(this_try) = request.try_clone() else {
                return self.inner.execute(request).await;
            };

            let delay = match self.inner.execute(this_try).await {
                Ok(response)
                    if is_retryable_status(response.status()) && attempt < self.policy.max_retries =>
                {
                    tracing::warn!(
                        url = %request.url(),
                        status = %response.status(),
                        attempt = attempt + 1,
                        "Retrying request after error status"
                    );
                    retry_after(&response)
                        .map(|d| d.min(self.policy.max_backoff))
                        .unwrap_or_else(|| self.policy.backoff(attempt))
                }
                Ok(response) => return Ok(response),
                Err(e) if is_retryable_error(&e) && attempt < self.policy.max_retries => {
                    tracing::warn!(
                        url = %request.url(),
                        error = %e,
                        attempt = attempt + 1,
                        "Retrying request after transport error"
                    );
                    self.policy.backoff(attempt)
                }
                Err(e) => return Err(e),
            };

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    /// Serve `/` failing with 503 `failures` times before answering 200.
    async fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        (AxumStatus::SERVICE_UNAVAILABLE, "busy")
                    } else {
                        (AxumStatus::OK, "ok")
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), hits)
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn test_recovers_from_transient_errors() {
        let (url, hits) = flaky_server(2).await;
        let client = RetryClient::new(fast_policy(3)).unwrap();

        let response = client.send(client.get(&url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (url, hits) = flaky_server(10).await;
        let client = RetryClient::new(fast_policy(2)).unwrap();

        let response = client.send(client.get(&url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        // Bind then drop to find a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RetryClient::new(fast_policy(1)).unwrap();
        let result = client.send(client.get(&format!("http://{}/", addr))).await;
        assert!(result.is_err());
    }
}
