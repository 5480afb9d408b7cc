//! Conversation state machine.
//!
//! A [`Conversation`] owns the transcript of one chat session and reconciles
//! replies, streamed fragments, failures and cancellation into it. Clones
//! share the same state, so a UI thread can read snapshots while a task
//! drives a request.
//!
//! ```rust,ignore
//! let conversation = Conversation::new(Client::new(Config::from_env()?)?);
//! conversation.send_message("Hola").await;
//! for message in conversation.messages().iter() {
//!     println!("{}: {}", message.role, message.content);
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::{
    backend::ChatBackend,
    errors::normalize_error,
    stream::{CancelHandle, StreamHandler},
    types::{ChatRequest, IdStrategy, Message, Role, WireTurn},
    DEFAULT_ERROR_MESSAGE,
};

/// Per-conversation settings.
#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub id_strategy: IdStrategy,
    /// Shown when a failure has no message of its own.
    pub fallback_error_message: String,
    /// Opaque context attached to every request unless overridden per send.
    pub context: Option<Map<String, Value>>,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategy::default(),
            fallback_error_message: DEFAULT_ERROR_MESSAGE.to_string(),
            context: None,
        }
    }
}

/// Options for [`Conversation::send_message_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Deliver the reply incrementally instead of as one envelope.
    pub stream: bool,
    /// Replaces the conversation-level context for this request.
    pub context: Option<Map<String, Value>>,
}

impl SendOptions {
    pub fn streaming() -> Self {
        Self {
            stream: true,
            ..Default::default()
        }
    }
}

/// Point-in-time view of a conversation for rendering.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub messages: Arc<Vec<Message>>,
    pub session_id: Option<String>,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub error: Option<String>,
    pub can_abort_streaming: bool,
}

#[derive(Default)]
struct ConversationState {
    /// Copy-on-write so snapshots handed out stay stable.
    messages: Arc<Vec<Message>>,
    session_id: Option<String>,
    is_loading: bool,
    is_streaming: bool,
    error: Option<String>,
    cancel_handle: Option<CancelHandle>,
    /// Assistant message fed by the active stream.
    streaming_message: Option<String>,
    /// Bumped by `reset` so late results from before it are dropped.
    epoch: u64,
}

impl ConversationState {
    fn append(&mut self, message: Message) {
        Arc::make_mut(&mut self.messages).push(message);
    }

    fn update<F>(&mut self, id: &str, patch: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        if !self.messages.iter().any(|m| m.id == id) {
            return false;
        }
        if let Some(message) = Arc::make_mut(&mut self.messages)
            .iter_mut()
            .find(|m| m.id == id)
        {
            patch(message);
        }
        true
    }

    fn remove(&mut self, id: &str) {
        if self.messages.iter().any(|m| m.id == id) {
            Arc::make_mut(&mut self.messages).retain(|m| m.id != id);
        }
    }

    fn is_active_stream(&self, id: &str) -> bool {
        self.streaming_message.as_deref() == Some(id)
    }

    fn clear_stream(&mut self) {
        self.is_streaming = false;
        self.is_loading = false;
        self.cancel_handle = None;
        self.streaming_message = None;
    }
}

/// Transcript plus request lifecycle for one chat session.
pub struct Conversation<B> {
    inner: Arc<ConversationInner<B>>,
}

impl<B> Clone for Conversation<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ConversationInner<B> {
    backend: B,
    options: ConversationOptions,
    state: Mutex<ConversationState>,
}

impl<B> ConversationInner<B> {
    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().expect("lock poisoned")
    }

    fn normalize(&self, err: &crate::Error) -> String {
        normalize_error(err, &self.options.fallback_error_message)
    }
}

impl<B: ChatBackend> Conversation<B> {
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, ConversationOptions::default())
    }

    pub fn with_options(backend: B, options: ConversationOptions) -> Self {
        Self {
            inner: Arc::new(ConversationInner {
                backend,
                options,
                state: Mutex::new(ConversationState::default()),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let state = self.inner.lock();
        ConversationSnapshot {
            messages: state.messages.clone(),
            session_id: state.session_id.clone(),
            is_loading: state.is_loading,
            is_streaming: state.is_streaming,
            error: state.error.clone(),
            can_abort_streaming: state.is_streaming && state.cancel_handle.is_some(),
        }
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        self.inner.lock().messages.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session_id.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.lock().is_loading
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().is_streaming
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// True while a stream is active and can still be cancelled.
    pub fn can_abort_streaming(&self) -> bool {
        let state = self.inner.lock();
        state.is_streaming && state.cancel_handle.is_some()
    }

    /// Send a user turn and wait for the full reply.
    ///
    /// Blank input is ignored. On success the transcript is replaced by the
    /// backend's history; on failure the user turn stays and `error` is set.
    /// Failures are reported through [`Conversation::error`].
    pub async fn send_message(&self, text: &str) {
        self.send_message_with(text, SendOptions::default()).await
    }

    pub async fn send_message_with(&self, text: &str, options: SendOptions) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        let user = Message::new(Role::User, trimmed, self.inner.options.id_strategy);
        let turn = WireTurn::from(&user);
        let context = options
            .context
            .or_else(|| self.inner.options.context.clone());

        if options.stream {
            {
                let mut state = self.inner.lock();
                state.append(user);
                state.error = None;
            }
            self.stream_turns(vec![turn], context).await;
            return;
        }

        let (payload, epoch) = {
            let mut state = self.inner.lock();
            state.append(user);
            state.error = None;
            state.is_loading = true;
            let payload =
                ChatRequest::new(state.session_id.clone(), vec![turn]).with_context(context);
            (payload, state.epoch)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(session_id = ?payload.session_id, "sending message");
        let result = self.inner.backend.send_chat(payload).await;

        let mut state = self.inner.lock();
        if state.epoch != epoch {
            #[cfg(feature = "tracing")]
            tracing::debug!("dropping reply for a reset conversation");
            return;
        }
        match result {
            Ok(reply) => {
                let ids = self.inner.options.id_strategy;
                state.messages = Arc::new(
                    reply
                        .history
                        .iter()
                        .map(|m| Message::from_backend(m, ids))
                        .collect(),
                );
                state.session_id = Some(reply.session_id);
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "send failed");
                state.error = Some(self.inner.normalize(&err));
            }
        }
        state.is_loading = false;
    }

    /// Stream a reply to `payload_messages` into a new pending assistant message.
    pub async fn handle_streaming_request(&self, payload_messages: Vec<WireTurn>) {
        let context = self.inner.options.context.clone();
        self.stream_turns(payload_messages, context).await;
    }

    async fn stream_turns(&self, turns: Vec<WireTurn>, context: Option<Map<String, Value>>) {
        let assistant = Message::pending_assistant(self.inner.options.id_strategy);
        let id = assistant.id.clone();

        let (payload, epoch) = {
            let mut state = self.inner.lock();
            state.append(assistant);
            state.is_streaming = true;
            state.streaming_message = Some(id.clone());
            let payload = ChatRequest::new(state.session_id.clone(), turns)
                .with_context(context)
                .streaming();
            (payload, state.epoch)
        };

        let handler = self.stream_handler(id.clone(), epoch);
        let opened = self.inner.backend.stream_chat(payload, handler).await;

        let mut state = self.inner.lock();
        if state.epoch != epoch {
            if let Ok(handle) = opened {
                handle.cancel();
            }
            return;
        }
        match opened {
            Ok(handle) => {
                // The stream may already have finished or been aborted.
                if state.is_active_stream(&id) {
                    state.cancel_handle = Some(handle);
                }
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "stream open failed");
                state.remove(&id);
                if state.is_active_stream(&id) {
                    state.clear_stream();
                }
                state.error = Some(self.inner.normalize(&err));
            }
        }
        state.is_loading = false;
    }

    /// Callbacks for one stream. They only touch state of the epoch that
    /// opened it.
    fn stream_handler(&self, id: String, epoch: u64) -> StreamHandler {
        let on_fragment = {
            let inner = self.inner.clone();
            let id = id.clone();
            move |fragment: String| {
                let mut state = inner.lock();
                if state.epoch == epoch {
                    state.update(&id, |m| m.content.push_str(&fragment));
                }
            }
        };
        let on_complete = {
            let inner = self.inner.clone();
            let id = id.clone();
            move || {
                let mut state = inner.lock();
                if state.epoch != epoch {
                    return;
                }
                state.update(&id, |m| m.pending = false);
                if state.is_active_stream(&id) {
                    state.clear_stream();
                }
            }
        };
        let on_error = {
            let inner = self.inner.clone();
            move |err: crate::Error| {
                let message = inner.normalize(&err);
                let mut state = inner.lock();
                if state.epoch != epoch {
                    return;
                }
                state.update(&id, |m| m.pending = false);
                if state.is_active_stream(&id) {
                    state.clear_stream();
                }
                // User aborts arrive here as `StreamCancelled` and are reported too.
                state.error = Some(message);
            }
        };
        StreamHandler::new(on_fragment)
            .on_complete(on_complete)
            .on_error(on_error)
    }

    /// Cancel the active stream, keeping whatever content already arrived.
    ///
    /// The cancelled read then reports [`crate::Error::StreamCancelled`]
    /// through `error`. Returns false when there is nothing to cancel.
    pub fn abort_stream(&self) -> bool {
        let mut state = self.inner.lock();
        let Some(handle) = state.cancel_handle.take() else {
            return false;
        };
        handle.cancel();
        state.clear_stream();
        #[cfg(feature = "tracing")]
        tracing::debug!("stream aborted");
        true
    }

    /// Drop the transcript, session and flags. Cancels an active stream.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        if let Some(handle) = state.cancel_handle.take() {
            handle.cancel();
        }
        let epoch = state.epoch.wrapping_add(1);
        *state = ConversationState {
            epoch,
            ..Default::default()
        };
    }
}
