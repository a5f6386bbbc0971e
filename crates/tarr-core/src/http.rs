//! Authenticated Graph GET with bounded retries.
//!
//! - 401: refresh the token once and repeat the request
//! - 429 / 5xx: wait `Retry-After` seconds when given, else linear backoff
//!   capped at `backoff_cap`, up to `max_retries` attempts
//! - transport failures, including a body cut short: same schedule, then
//!   `HttpError::Transport`
//! - cancellation aborts token calls, in-flight requests and body reads

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use tarr_auth_bridge::TokenSource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel::{ensure_active, or_cancel, sleep_or_cancel};
use crate::error::{ConfigError, HttpError, Result};
use crate::paging::PageRequest;

/// Longest response body kept in an `HttpError::Status`.
pub const MAX_ERROR_BODY_CHARS: usize = 800;

/// Anything that can answer a paged Graph GET with a JSON body.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, request: &PageRequest) -> Result<Value>;
}

/// Retry schedule for one GET.
///
/// Without `Retry-After` the wait after attempt `n` is `backoff_base × n`,
/// capped at `backoff_cap`. A numeric `Retry-After` replaces that value but
/// is clamped to `backoff_cap` as well, so a throttled call never sleeps
/// longer than the cap between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based) when the
    /// server gave no `Retry-After`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(attempt.max(1))
            .min(self.backoff_cap)
    }

    /// Server-dictated delay wins over the backoff schedule. It is still
    /// held to the cap so a call stays bounded by `max_retries × cap`.
    pub fn retry_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs).min(self.backoff_cap),
            None => self.backoff_delay(attempt),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ResilientHttpClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ResilientHttpClient {
    pub fn new(tokens: Arc<dyn TokenSource>, settings: &HttpSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            http,
            tokens,
            policy: settings.retry.clone(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get(&self, request: &PageRequest) -> Result<Value> {
        let url = request.url();
        let max_attempts = self.policy.attempts();
        let mut token = or_cancel(self.tokens.token(), &self.cancel).await??;
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            ensure_active(&self.cancel)?;
            attempt += 1;

            let mut builder = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header(ACCEPT, "application/json");
            if !request.params().is_empty() {
                builder = builder.query(request.params());
            }

            let response = match or_cancel(builder.send(), &self.cancel).await? {
                Ok(response) => response,
                Err(err) => {
                    if attempt < max_attempts && is_retryable_transport_error(&err) {
                        let delay = self.policy.backoff_delay(attempt);
                        warn!(url, attempt, error = %err, "request failed, retrying in {:?}", delay);
                        sleep_or_cancel(delay, &self.cancel).await?;
                        continue;
                    }
                    return Err(HttpError::Transport {
                        url: url.to_string(),
                        attempts: attempt,
                        source: err,
                    }
                    .into());
                }
            };

            let status = response.status();
            if status.is_success() {
                let text = match or_cancel(response.text(), &self.cancel).await? {
                    Ok(text) => text,
                    Err(err) => {
                        if attempt < max_attempts && is_retryable_transport_error(&err) {
                            let delay = self.policy.backoff_delay(attempt);
                            warn!(url, attempt, error = %err, "body read failed, retrying in {:?}", delay);
                            sleep_or_cancel(delay, &self.cancel).await?;
                            continue;
                        }
                        return Err(HttpError::Transport {
                            url: url.to_string(),
                            attempts: attempt,
                            source: err,
                        }
                        .into());
                    }
                };
                return decode_body(url, &text);
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(url, "token rejected (401), refreshing once");
                token = or_cancel(self.tokens.refresh(), &self.cancel).await??;
                refreshed = true;
                // The retry with the new token does not consume an attempt.
                attempt -= 1;
                continue;
            }

            if is_retryable_status(status) && attempt < max_attempts {
                let retry_after = parse_retry_after(response.headers());
                let delay = self.policy.retry_delay(attempt, retry_after);
                warn!(
                    url,
                    status = status.as_u16(),
                    attempt,
                    max_attempts,
                    retry_after_secs = ?retry_after,
                    "retrying in {:?}",
                    delay
                );
                sleep_or_cancel(delay, &self.cancel).await?;
                continue;
            }

            let body = or_cancel(response.text(), &self.cancel).await?.unwrap_or_default();
            if status == StatusCode::FORBIDDEN {
                warn!(url, "access forbidden (403), check the granted Graph scopes");
            }
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            }
            .into());
        }
    }
}

#[async_trait]
impl JsonSource for ResilientHttpClient {
    async fn get_json(&self, request: &PageRequest) -> Result<Value> {
        self.get(request).await
    }
}

fn decode_body(url: &str, text: &str) -> Result<Value> {
    debug!(url, bytes = text.len(), "GET ok");
    serde_json::from_str(text).map_err(|source| {
        HttpError::Decode {
            url: url.to_string(),
            source,
        }
        .into()
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Integer-seconds `Retry-After`. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
