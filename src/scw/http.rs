//! HTTP utilities for Scaleway REST API calls
//!
//! Wraps a shared `reqwest::Client` with the retry rules every API call gets:
//! `429 Too Many Requests` is retried with exponential backoff, transport failures are
//! retried for idempotent methods, and every await point observes the cancellation token.

use crate::error::{ApiError, ApiErrorBody, Error, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Header carrying the secret key on every Scaleway API call
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Retry rules applied by [`ScwHttpClient`]
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests)
    pub fn immediate() -> Self {
        Self {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`; a server-provided `Retry-After` wins but is
    /// still clamped to the policy bounds.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .min_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        retry_after
            .unwrap_or(exponential)
            .clamp(self.min_backoff, self.max_backoff)
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Sleep unless the token fires first
pub async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Raw answer of a request, status included
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// HTTP client wrapper for Scaleway API calls
#[derive(Clone)]
pub struct ScwHttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl ScwHttpClient {
    /// Create a new HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("scw-provider/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Send a request built by `build`, retrying according to the policy.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` is consumed by `send`.
    pub async fn execute<F>(
        &self,
        cancel: &CancellationToken,
        method: &Method,
        url: &str,
        build: F,
    ) -> Result<RawResponse>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let cancelled = || Error::Cancelled {
            what: format!("{} {}", method, url),
            last: None,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!("{} {} (attempt {})", method, url, attempt);

            let request = build(&self.client)?;
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                sent = request.send() => sent,
            };

            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.retry.max_attempts
                    {
                        let wait = self.retry.backoff(attempt, retry_after(response.headers()));
                        tracing::warn!("{} {} rate limited, retrying in {:?}", method, url, wait);
                        if !sleep_cancellable(cancel, wait).await {
                            return Err(cancelled());
                        }
                        continue;
                    }

                    let headers = response.headers().clone();
                    let body = tokio::select! {
                        _ = cancel.cancelled() => return Err(cancelled()),
                        body = response.text() => body?,
                    };
                    return Ok(RawResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Err(err)
                    if is_idempotent(method)
                        && attempt < self.retry.max_attempts
                        && (err.is_connect() || err.is_timeout() || err.is_request()) =>
                {
                    let wait = self.retry.backoff(attempt, None);
                    tracing::warn!("{} {} failed: {}, retrying in {:?}", method, url, err, wait);
                    if !sleep_cancellable(cancel, wait).await {
                        return Err(cancelled());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Make a JSON request to a Scaleway API
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        token: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self
            .execute(cancel, &method, url, |client| {
                let mut request = client.request(method.clone(), url);
                if let Some(token) = token {
                    request = request.header(AUTH_HEADER, token);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                Ok(request)
            })
            .await?;

        if !response.status.is_success() {
            // Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::error!(
                "API error: {} - {}",
                response.status,
                sanitize_for_log(&response.body)
            );
            return Err(api_error(&method, url, &response));
        }

        // Handle empty response
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&response.body)?)
    }
}

/// Build the classified error for a failed answer
pub fn api_error(method: &Method, url: &str, response: &RawResponse) -> Error {
    let body = serde_json::from_str::<ApiErrorBody>(&response.body).unwrap_or_else(|_| {
        ApiErrorBody {
            message: Some(sanitize_for_log(&response.body)),
            ..Default::default()
        }
    });
    Error::Api(ApiError {
        status: response.status.as_u16(),
        method: method.to_string(),
        url: url.to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(500);
        let sanitized = sanitize_for_log(&body);
        assert!(sanitized.contains("truncated, 500 bytes total"));
        assert!(sanitized.len() < 300);
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize_for_log("a\nb\tc"), "abc");
    }

    #[test]
    fn test_backoff_grows_and_clamps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1, None), Duration::from_secs(2));
        assert_eq!(policy.backoff(2, None), Duration::from_secs(4));
        assert_eq!(policy.backoff(3, None), Duration::from_secs(8));
        assert_eq!(policy.backoff(20, None), Duration::from_secs(120));
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(600))),
            Duration::from_secs(120)
        );
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(0))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }
}
