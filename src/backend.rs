use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    errors::Result,
    stream::{CancelHandle, StreamHandler},
    types::{ChatReply, ChatRequest},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Network side of a conversation.
///
/// [`crate::Client`] is the HTTP implementation; [`crate::mock::MockBackend`]
/// replays scripted results.
pub trait ChatBackend: Send + Sync + 'static {
    /// Send a request and wait for the full reply envelope.
    fn send_chat(&self, payload: ChatRequest) -> BoxFuture<'_, Result<ChatReply>>;

    /// Open a streamed reply.
    ///
    /// Resolves once the response is accepted; open failures are returned
    /// here and never reach `handler`.
    fn stream_chat(
        &self,
        payload: ChatRequest,
        handler: StreamHandler,
    ) -> BoxFuture<'_, Result<CancelHandle>>;
}

impl<B: ChatBackend> ChatBackend for Arc<B> {
    fn send_chat(&self, payload: ChatRequest) -> BoxFuture<'_, Result<ChatReply>> {
        (**self).send_chat(payload)
    }

    fn stream_chat(
        &self,
        payload: ChatRequest,
        handler: StreamHandler,
    ) -> BoxFuture<'_, Result<CancelHandle>> {
        (**self).stream_chat(payload, handler)
    }
}
