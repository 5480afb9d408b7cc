use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, telemetry::StreamTelemetry};

/// Raw response body as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

type FragmentFn = Box<dyn FnMut(String) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;

/// Consumer callbacks for an open stream.
///
/// `on_fragment` runs once per decoded fragment, in order, and the next chunk
/// is not read until it returns. Exactly one of `on_complete`/`on_error` runs
/// at the end.
pub struct StreamHandler {
    on_fragment: FragmentFn,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl StreamHandler {
    pub fn new<F>(on_fragment: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        Self {
            on_fragment: Box::new(on_fragment),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Capability to stop an in-flight stream.
///
/// Cancelling drops the response body, which aborts the connection; the
/// stream's error callback then receives [`Error::StreamCancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Stateful UTF-8 decoder that reassembles code points split across chunks.
///
/// Invalid sequences decode to U+FFFD rather than failing the stream.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    pending: Vec<u8>,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            // Truncated sequence; wait for the next chunk.
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush bytes held back at end of input.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}

/// Spawn the read-decode-deliver loop for an opened body.
pub(crate) fn spawn_pull_loop(
    body: ByteStream,
    handler: StreamHandler,
    telemetry: Option<StreamTelemetry>,
) -> CancelHandle {
    let handle = CancelHandle::new();
    let token = handle.token.clone();
    tokio::spawn(pull_loop(body, handler, token, telemetry));
    handle
}

async fn pull_loop(
    mut body: ByteStream,
    handler: StreamHandler,
    token: CancellationToken,
    mut telemetry: Option<StreamTelemetry>,
) {
    let StreamHandler {
        mut on_fragment,
        on_complete,
        on_error,
    } = handler;
    let mut decoder = IncrementalDecoder::new();
    let mut fragments = 0usize;

    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break Error::StreamCancelled,
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let text = decoder.decode(&chunk);
                if text.is_empty() {
                    continue;
                }
                if let Some(t) = telemetry.as_mut() {
                    t.on_fragment();
                }
                fragments += 1;
                on_fragment(text);
            }
            Some(Err(err)) => break err,
            None => {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    on_fragment(tail);
                }
                if let Some(t) = telemetry.as_mut() {
                    t.on_closed();
                }
                #[cfg(feature = "tracing")]
                tracing::debug!(fragments, "stream completed");
                if let Some(cb) = on_complete {
                    cb();
                }
                return;
            }
        }
    };

    drop(body);
    if let Some(t) = telemetry.as_mut() {
        t.on_error(&failure);
    }
    log_failure(fragments, &failure);
    if let Some(cb) = on_error {
        cb(failure);
    }
}

fn log_failure(fragments: usize, failure: &Error) {
    #[cfg(feature = "tracing")]
    {
        if failure.is_cancelled() {
            tracing::debug!(fragments, "stream cancelled");
        } else {
            tracing::warn!(fragments, error = %failure, "stream failed");
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (fragments, failure);
}
