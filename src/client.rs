use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Method, StatusCode,
};
use tokio::time::sleep;

use crate::{
    auth_events::AuthEvents,
    backend::{BoxFuture, ChatBackend},
    errors::{Error, Result, RetryMetadata, TransportError},
    http::{parse_api_error_parts, request_id_from_headers, RetryConfig},
    stream::{spawn_pull_loop, CancelHandle, StreamHandler},
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    types::{ChatReply, ChatRequest},
    BASE_URL_ENV, CHAT_PATH, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Backend root; `/chat` is appended to it.
    pub base_url: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Deadline for non-streaming requests (defaults to 20s). Streams have none.
    pub timeout: Option<Duration>,
    /// Retry policy for non-streaming requests (defaults to one retry).
    pub retry: Option<RetryConfig>,
    /// Extra headers applied to every request.
    pub default_headers: Option<HeaderMap>,
    /// Where 401 notifications are published. A private registry is created when unset.
    pub auth_events: Option<AuthEvents>,
    /// Optional metrics callbacks (HTTP latency, first-fragment latency).
    pub metrics: Option<MetricsCallbacks>,
}

impl Config {
    /// Read the backend address from `CHATWIRE_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config(format!("{BASE_URL_ENV} is not set")))?;
        Ok(Self {
            base_url: Some(base_url),
            ..Default::default()
        })
    }
}

/// HTTP client for the chat endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    chat_url: reqwest::Url,
    http: reqwest::Client,
    request_timeout: Duration,
    retry: RetryConfig,
    default_headers: HeaderMap,
    auth_events: AuthEvents,
    telemetry: Telemetry,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let base = cfg
            .base_url
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::Config("base url is required".to_string()))?;
        let chat_url = reqwest::Url::parse(&format!(
            "{}{}",
            base.trim().trim_end_matches('/'),
            CHAT_PATH
        ))
        .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| TransportError::from_reqwest(err, None))?,
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                chat_url,
                http,
                request_timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                retry: cfg.retry.unwrap_or_default(),
                default_headers: cfg.default_headers.unwrap_or_default(),
                auth_events: cfg.auth_events.unwrap_or_default(),
                telemetry: Telemetry::new(cfg.metrics),
            }),
        })
    }

    /// Registry notified on every 401 response.
    pub fn auth_events(&self) -> &AuthEvents {
        &self.inner.auth_events
    }

    pub fn chat_url(&self) -> &reqwest::Url {
        &self.inner.chat_url
    }

    /// `POST /chat` and wait for the reply envelope, retrying per [`RetryConfig`].
    pub async fn chat(&self, payload: ChatRequest) -> Result<ChatReply> {
        payload.validate()?;
        let builder = self
            .inner
            .request()
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(self.inner.request_timeout)
            .json(&payload);
        let ctx = RequestContext::new(Method::POST.as_str(), CHAT_PATH)
            .with_session_id(payload.session_id.clone());

        let resp = self.inner.send_with_retry(builder, ctx).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(err, None))?;
        serde_json::from_slice(&bytes).map_err(Error::Serialization)
    }

    /// `POST /chat` with `stream: true` and hand the body to a pull loop.
    ///
    /// A non-2xx status or a null-body status (204, 205) fails here; later
    /// failures go to the handler's error callback.
    pub async fn stream_chat(
        &self,
        payload: ChatRequest,
        handler: StreamHandler,
    ) -> Result<CancelHandle> {
        let payload = payload.streaming();
        payload.validate()?;
        let ctx = RequestContext::new(Method::POST.as_str(), CHAT_PATH)
            .with_session_id(payload.session_id.clone());
        let start = Instant::now();

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.inner.chat_url, "opening stream");
        let resp = self
            .inner
            .request()
            .json(&payload)
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(err, None))?;

        let status = resp.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                self.inner.auth_events.notify_unauthorized();
            }
            #[cfg(feature = "tracing")]
            tracing::warn!(status = %status, "stream open rejected");
            return Err(Error::StreamStatus {
                status: status.as_u16(),
            });
        }
        // Null-body statuses have nothing to read; an empty 200 streams to completion.
        if matches!(status, StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT) {
            return Err(Error::StreamBodyMissing);
        }

        let ctx = ctx.with_request_id(request_id_from_headers(resp.headers()));
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| Error::from(TransportError::from_reqwest(err, None))));
        let telemetry = self.inner.telemetry.stream_state(ctx, start);
        Ok(spawn_pull_loop(Box::pin(body), handler, telemetry))
    }
}

impl ChatBackend for Client {
    fn send_chat(&self, payload: ChatRequest) -> BoxFuture<'_, Result<ChatReply>> {
        Box::pin(self.chat(payload))
    }

    fn stream_chat(
        &self,
        payload: ChatRequest,
        handler: StreamHandler,
    ) -> BoxFuture<'_, Result<CancelHandle>> {
        Box::pin(Client::stream_chat(self, payload, handler))
    }
}

impl ClientInner {
    fn request(&self) -> reqwest::RequestBuilder {
        self.http
            .request(Method::POST, self.chat_url.clone())
            .headers(self.default_headers.clone())
    }

    async fn send_with_retry(
        &self,
        builder: reqwest::RequestBuilder,
        ctx: RequestContext,
    ) -> Result<reqwest::Response> {
        let max_attempts = self.retry.max_attempts();
        let mut state = RetryState::new();
        let start = Instant::now();

        for attempt in 1..=max_attempts {
            let attempt_builder = builder
                .try_clone()
                .ok_or_else(|| Error::Config("request body is not cloneable for retry".into()))?;
            #[cfg(feature = "tracing")]
            let result = {
                use tracing::Instrument;
                attempt_builder
                    .send()
                    .instrument(tracing::debug_span!(
                        "chatwire.http",
                        method = %ctx.method,
                        path = %ctx.path,
                        attempt,
                        max_attempts
                    ))
                    .await
            };
            #[cfg(not(feature = "tracing"))]
            let result = attempt_builder.send().await;
            state.record_attempt(attempt);

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.record_http(&ctx, &state, start, Some(status), None, resp.headers());
                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            status = %status,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "request completed"
                        );
                        return Ok(resp);
                    }
                    state.record_status(status);

                    if status == StatusCode::UNAUTHORIZED {
                        self.auth_events.notify_unauthorized();
                    }

                    if self.retry.should_retry_status(status) && attempt < max_attempts {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(status = %status, "retrying after status");
                        sleep(self.retry.backoff_delay(attempt)).await;
                        continue;
                    }

                    let headers = resp.headers().clone();
                    self.record_http(
                        &ctx,
                        &state,
                        start,
                        Some(status),
                        Some(format!("http {}", status.as_u16())),
                        &headers,
                    );
                    #[cfg(feature = "tracing")]
                    tracing::warn!(status = %status, attempt, "request failed; returning error");
                    let body = resp.text().await.unwrap_or_default();
                    return Err(parse_api_error_parts(status, &headers, body, state.metadata()));
                }
                Err(err) => {
                    state.record_error(&err);
                    if self.retry.should_retry_error(&err) && attempt < max_attempts {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %err, "retrying after timeout");
                        sleep(self.retry.backoff_delay(attempt)).await;
                        continue;
                    }

                    self.record_http(
                        &ctx,
                        &state,
                        start,
                        None,
                        Some(err.to_string()),
                        &HeaderMap::new(),
                    );
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, error = %err, "transport error");
                    return Err(TransportError::from_reqwest(err, state.metadata()).into());
                }
            }
        }

        Err(Error::Config("retry policy allows no attempts".to_string()))
    }

    fn record_http(
        &self,
        ctx: &RequestContext,
        state: &RetryState,
        start: Instant,
        status: Option<StatusCode>,
        error: Option<String>,
        headers: &HeaderMap,
    ) {
        if !self.telemetry.http_enabled() {
            return;
        }
        self.telemetry.record_http(HttpRequestMetrics {
            latency: start.elapsed(),
            status: status.map(|s| s.as_u16()),
            error,
            retries: state.metadata(),
            context: ctx.clone().with_request_id(request_id_from_headers(headers)),
        });
    }
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
    last_status: Option<u16>,
    last_error: Option<String>,
}

impl RetryState {
    fn new() -> Self {
        Self::default()
    }

    fn record_attempt(&mut self, attempt: u32) {
        self.attempts = attempt;
    }

    fn record_status(&mut self, status: StatusCode) {
        self.last_status = Some(status.as_u16());
    }

    fn record_error(&mut self, err: &reqwest::Error) {
        self.last_error = Some(err.to_string());
    }

    fn metadata(&self) -> Option<RetryMetadata> {
        if self.attempts <= 1 {
            None
        } else {
            Some(RetryMetadata {
                attempts: self.attempts,
                last_status: self.last_status,
                last_error: self.last_error.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_required() {
        let err = Client::new(Config::default())
            .err()
            .expect("missing base url should fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn chat_path_is_appended_to_base() {
        let client = Client::new(Config {
            base_url: Some("http://localhost:8000/api/".into()),
            ..Default::default()
        })
        .expect("client");
        assert_eq!(client.chat_url().as_str(), "http://localhost:8000/api/chat");
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let err = Client::new(Config {
            base_url: Some("not a url".into()),
            ..Default::default()
        })
        .err()
        .expect("invalid url");
        assert!(err.to_string().contains("invalid base url"));
    }

    #[test]
    fn config_from_env_reads_base_url() {
        std::env::remove_var(BASE_URL_ENV);
        assert!(matches!(Config::from_env(), Err(Error::Config(_))));

        std::env::set_var(BASE_URL_ENV, "http://chat.internal:8000");
        let cfg = Config::from_env().expect("config");
        std::env::remove_var(BASE_URL_ENV);
        assert_eq!(cfg.base_url.as_deref(), Some("http://chat.internal:8000"));
        assert!(cfg.retry.is_none());
    }

    #[test]
    fn retry_state_reports_only_after_retry() {
        let mut state = RetryState::new();
        state.record_attempt(1);
        assert!(state.metadata().is_none());
        state.record_attempt(2);
        state.record_status(StatusCode::SERVICE_UNAVAILABLE);
        let meta = state.metadata().expect("metadata");
        assert_eq!(meta.attempts, 2);
        assert_eq!(meta.last_status, Some(503));
    }
}
