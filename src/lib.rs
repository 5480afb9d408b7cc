//! Streaming-capable chat client with bounded retry and a conversation state machine.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::result_large_err)]

/// Path of the chat endpoint, relative to the configured base URL.
pub const CHAT_PATH: &str = "/chat";

/// Environment variable read by [`Config::from_env`].
pub const BASE_URL_ENV: &str = "CHATWIRE_BASE_URL";

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default deadline for non-streaming requests (20 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Message shown for failures that carry no message of their own.
pub const DEFAULT_ERROR_MESSAGE: &str = "Algo salió mal. Intenta nuevamente.";

mod auth_events;
mod backend;
mod client;
mod conversation;
mod errors;
mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod stream;
mod telemetry;
mod types;

pub use auth_events::{AuthEvents, SubscriptionId};
pub use backend::{BoxFuture, ChatBackend};
pub use client::{Client, Config};
pub use conversation::{Conversation, ConversationOptions, ConversationSnapshot, SendOptions};
pub use errors::{
    normalize_error, APIError, Error, Result, RetryMetadata, TransportError, TransportErrorKind,
    ValidationError,
};
pub use http::{RetryConfig, RETRY_STATUS};
pub use stream::{ByteStream, CancelHandle, IncrementalDecoder, StreamHandler};
pub use telemetry::{
    HttpRequestMetrics, MetricsCallbacks, RequestContext, StreamFirstFragmentMetrics,
};
pub use types::{
    parse_timestamp, BackendMessage, ChatReply, ChatRequest, IdStrategy, Message, Role, WireTurn,
};
