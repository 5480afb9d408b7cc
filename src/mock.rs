use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;

use crate::{
    backend::{BoxFuture, ChatBackend},
    errors::{Error, Result, ValidationError},
    stream::{spawn_pull_loop, ByteStream, CancelHandle, StreamHandler},
    types::{BackendMessage, ChatReply, ChatRequest, Role},
};

/// Scripted body for one `stream_chat` call.
pub enum MockStream {
    /// Chunks replayed back to back, then end of stream.
    Chunks(Vec<Result<Bytes>>),
    /// Chunks pushed by the test through a [`MockStreamSender`].
    Live(mpsc::UnboundedReceiver<Result<Bytes>>),
    /// The open call itself fails.
    OpenError(Error),
}

/// Test-side end of a [`MockStream::Live`] body. Dropping it ends the stream.
pub struct MockStreamSender {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
}

impl MockStreamSender {
    pub fn send(&self, chunk: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(chunk.into()));
    }

    pub fn fail(&self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    pub fn finish(self) {}
}

/// Build a live stream body and the sender that feeds it.
pub fn live_stream() -> (MockStreamSender, MockStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MockStreamSender { tx }, MockStream::Live(rx))
}

/// In-memory mock configuration for offline tests.
#[derive(Default)]
pub struct MockConfig {
    pub chat_replies: Vec<Result<ChatReply>>,
    pub streams: Vec<MockStream>,
}

impl MockConfig {
    pub fn with_reply(mut self, reply: ChatReply) -> Self {
        self.chat_replies.push(Ok(reply));
        self
    }

    pub fn with_error(mut self, err: Error) -> Self {
        self.chat_replies.push(Err(err));
        self
    }

    pub fn with_stream(mut self, stream: MockStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn with_stream_chunks<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from(c.into())))
            .collect();
        self.with_stream(MockStream::Chunks(chunks))
    }
}

/// Backend replaying [`MockConfig`] in order and recording every request.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

struct MockInner {
    chat_replies: Mutex<VecDeque<Result<ChatReply>>>,
    streams: Mutex<VecDeque<MockStream>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    pub fn new(cfg: MockConfig) -> Self {
        Self {
            inner: Arc::new(MockInner {
                chat_replies: Mutex::new(VecDeque::from(cfg.chat_replies)),
                streams: Mutex::new(VecDeque::from(cfg.streams)),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner.requests.lock().expect("lock poisoned").clone()
    }

    fn record(&self, payload: &ChatRequest) {
        self.inner
            .requests
            .lock()
            .expect("lock poisoned")
            .push(payload.clone());
    }

    fn next_reply(&self) -> Result<ChatReply> {
        self.inner
            .chat_replies
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(Error::Validation("no mock chat reply queued".into())))
    }

    fn next_stream(&self) -> Result<MockStream> {
        self.inner
            .streams
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| Error::Validation(ValidationError::new("no mock stream queued")))
    }
}

impl ChatBackend for MockBackend {
    fn send_chat(&self, payload: ChatRequest) -> BoxFuture<'_, Result<ChatReply>> {
        Box::pin(async move {
            payload.validate()?;
            self.record(&payload);
            self.next_reply()
        })
    }

    fn stream_chat(
        &self,
        payload: ChatRequest,
        handler: StreamHandler,
    ) -> BoxFuture<'_, Result<CancelHandle>> {
        Box::pin(async move {
            let payload = payload.streaming();
            payload.validate()?;
            self.record(&payload);
            let body: ByteStream = match self.next_stream()? {
                MockStream::Chunks(chunks) => Box::pin(stream::iter(chunks)),
                MockStream::Live(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })),
                MockStream::OpenError(err) => return Err(err),
            };
            Ok(spawn_pull_loop(body, handler, None))
        })
    }
}

/// Fixtures for wire-shaped replies.
pub mod fixtures {
    use super::*;

    pub const TIMESTAMP: &str = "2024-01-01T00:00:00Z";

    pub fn backend_message(role: Role, content: &str) -> BackendMessage {
        BackendMessage {
            role,
            content: content.to_string(),
            timestamp: TIMESTAMP.to_string(),
        }
    }

    /// Reply whose history is `user_text` followed by `reply_text`.
    pub fn reply(session_id: &str, user_text: &str, reply_text: &str) -> ChatReply {
        let reply = backend_message(Role::Assistant, reply_text);
        ChatReply {
            session_id: session_id.to_string(),
            history: vec![backend_message(Role::User, user_text), reply.clone()],
            reply,
        }
    }
}
