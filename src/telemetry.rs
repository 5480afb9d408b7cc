use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{errors::Error, RetryMetadata};

/// User-provided callbacks for emitting metrics without taking on a tracing dependency.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    pub http_request: Option<Arc<dyn Fn(HttpRequestMetrics) + Send + Sync>>,
    pub stream_first_fragment: Option<Arc<dyn Fn(StreamFirstFragmentMetrics) + Send + Sync>>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCallbacks")
            .field(
                "http_request",
                &self.http_request.as_ref().map(|_| "callback"),
            )
            .field(
                "stream_first_fragment",
                &self.stream_first_fragment.as_ref().map(|_| "callback"),
            )
            .finish()
    }
}

/// Request metadata shared by all telemetry events.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if let Some(id) = request_id {
            if !id.trim().is_empty() {
                self.request_id = Some(id);
            }
        }
        self
    }
}

/// HTTP request latency and outcome, reported once per logical request.
#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub retries: Option<RetryMetadata>,
    pub context: RequestContext,
}

/// Time from opening a stream to its first fragment (or its failure).
#[derive(Clone, Debug)]
pub struct StreamFirstFragmentMetrics {
    pub latency: Duration,
    pub error: Option<String>,
    pub context: RequestContext,
}

#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn http_enabled(&self) -> bool {
        self.callbacks.http_request.is_some()
    }

    pub fn record_http(&self, metrics: HttpRequestMetrics) {
        if let Some(cb) = &self.callbacks.http_request {
            cb(metrics);
        }
    }

    pub fn stream_state(&self, context: RequestContext, start: Instant) -> Option<StreamTelemetry> {
        self.callbacks
            .stream_first_fragment
            .as_ref()
            .map(|cb| StreamTelemetry {
                callback: cb.clone(),
                context,
                start,
                recorded: false,
            })
    }
}

/// First-fragment tracker owned by a single pull loop.
pub(crate) struct StreamTelemetry {
    callback: Arc<dyn Fn(StreamFirstFragmentMetrics) + Send + Sync>,
    context: RequestContext,
    start: Instant,
    recorded: bool,
}

impl StreamTelemetry {
    pub fn on_fragment(&mut self) {
        self.record(None);
    }

    pub fn on_error(&mut self, error: &Error) {
        self.record(Some(error.to_string()));
    }

    pub fn on_closed(&mut self) {
        self.record(Some("stream closed".to_string()));
    }

    fn record(&mut self, error: Option<String>) {
        if std::mem::replace(&mut self.recorded, true) {
            return;
        }
        (self.callback)(StreamFirstFragmentMetrics {
            latency: self.start.elapsed(),
            error,
            context: self.context.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_callbacks() -> (MetricsCallbacks, Arc<Mutex<Vec<StreamFirstFragmentMetrics>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callbacks = MetricsCallbacks {
            stream_first_fragment: Some(Arc::new(move |metrics| {
                sink.lock().unwrap().push(metrics);
            })),
            ..Default::default()
        };
        (callbacks, calls)
    }

    #[test]
    fn first_fragment_fires_once() {
        let (callbacks, calls) = recording_callbacks();
        let telemetry = Telemetry::new(Some(callbacks));
        let ctx = RequestContext::new("POST", "/chat").with_session_id(Some("s1".into()));
        let mut stream = telemetry
            .stream_state(ctx, Instant::now())
            .expect("stream state");

        stream.on_fragment();
        stream.on_fragment();
        stream.on_error(&Error::StreamCancelled);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].error.is_none());
        assert_eq!(calls[0].context.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn error_before_first_fragment_is_recorded() {
        let (callbacks, calls) = recording_callbacks();
        let telemetry = Telemetry::new(Some(callbacks));
        let mut stream = telemetry
            .stream_state(RequestContext::new("POST", "/chat"), Instant::now())
            .expect("stream state");

        stream.on_error(&Error::StreamCancelled);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].error.as_deref(), Some("stream cancelled"));
    }

    #[test]
    fn disabled_stream_metrics_build_nothing() {
        let telemetry = Telemetry::new(None);
        assert!(telemetry
            .stream_state(RequestContext::new("POST", "/chat"), Instant::now())
            .is_none());
        assert!(!telemetry.http_enabled());
    }
}
