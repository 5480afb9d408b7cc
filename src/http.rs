use std::time::Duration;

use reqwest::{header::HeaderMap, StatusCode};

use crate::errors::{APIError, Error, RetryMetadata};

/// Statuses worth re-issuing the same request for.
pub const RETRY_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Retry/backoff configuration (defaults to one retry with a 300ms linear step).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay multiplied by the retry number before re-issuing a request.
    pub backoff_step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_step: Duration::from_millis(300),
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether the given response status should trigger a retry.
    pub fn should_retry_status(&self, status: StatusCode) -> bool {
        RETRY_STATUS.contains(&status.as_u16())
    }

    /// Whether the given transport error should trigger a retry.
    ///
    /// Only a client-side timeout with no response qualifies; connection
    /// failures surface immediately.
    pub fn should_retry_error(&self, err: &reqwest::Error) -> bool {
        err.is_timeout() && err.status().is_none()
    }

    /// Linear backoff for the given retry (1-indexed).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.backoff_step.saturating_mul(retry.max(1))
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Request-Id")
        .and_then(|value| value.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build an [`APIError`] from a failed response, reading the usual JSON error shapes.
pub(crate) fn parse_api_error_parts(
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
    retries: Option<RetryMetadata>,
) -> Error {
    let request_id = request_id_from_headers(headers);
    let status_text = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();
    let mut err = APIError {
        status: status.as_u16(),
        code: None,
        message: status_text,
        request_id,
        retries,
        raw_body: None,
    };

    if body.trim().is_empty() {
        return err.into();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        let source = value
            .get("error")
            .filter(|v| v.is_object())
            .unwrap_or(&value);
        if let Some(code) = source.get("code").and_then(|v| v.as_str()) {
            err.code = Some(code.to_string());
        }
        // `detail` is what the backend's framework emits for HTTPException.
        if let Some(message) = source
            .get("message")
            .or_else(|| source.get("detail"))
            .and_then(|v| v.as_str())
        {
            err.message = message.to_string();
        }
        if let Some(req_id) = value.get("request_id").and_then(|v| v.as_str()) {
            err.request_id = Some(req_id.to_string());
        }
    } else {
        err.message = body.clone();
    }

    err.raw_body = Some(body);
    err.into()
}
