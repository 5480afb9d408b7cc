use std::fmt;

use rand::{rngs::OsRng, TryRngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{
    format_description::well_known::{Iso8601, Rfc3339},
    macros::format_description,
    Date, OffsetDateTime, PrimitiveDateTime,
};

use crate::errors::{Error, ValidationError};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How local message identifiers are minted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdStrategy {
    /// Random v4 UUIDs from the OS entropy source. Falls back to
    /// [`IdStrategy::Fastrand`] when the entropy source fails.
    #[default]
    Uuid,
    /// Base-36 strings from a non-cryptographic PRNG, for targets without an
    /// entropy source.
    Fastrand,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Uuid => uuid_or_fallback(os_random_bytes()),
            IdStrategy::Fastrand => fastrand_id(),
        }
    }
}

fn os_random_bytes() -> Option<[u8; 16]> {
    let mut bytes = [0_u8; 16];
    let mut rng = OsRng;
    match rng.try_fill_bytes(&mut bytes) {
        Ok(()) => Some(bytes),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_err, "os entropy unavailable; using fastrand ids");
            None
        }
    }
}

fn uuid_or_fallback(bytes: Option<[u8; 16]>) -> String {
    match bytes {
        Some(bytes) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        None => fastrand_id(),
    }
}

fn fastrand_id() -> String {
    let hi = to_base36(fastrand::u64(..));
    let lo = to_base36(fastrand::u64(..));
    format!("{hi}{lo}")
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// One turn of the local transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Set while an assistant reply is still streaming in.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, ids: IdStrategy) -> Self {
        Self {
            id: ids.generate(),
            role,
            content: content.into(),
            created_at: OffsetDateTime::now_utc(),
            pending: false,
        }
    }

    /// Empty assistant turn awaiting its first fragment.
    pub fn pending_assistant(ids: IdStrategy) -> Self {
        Self {
            pending: true,
            ..Self::new(Role::Assistant, String::new(), ids)
        }
    }

    /// Adapt a backend history entry, minting a fresh local id.
    pub fn from_backend(message: &BackendMessage, ids: IdStrategy) -> Self {
        Self {
            created_at: parse_timestamp(&message.timestamp),
            ..Self::new(message.role, message.content.clone(), ids)
        }
    }

    pub fn to_backend(&self) -> BackendMessage {
        BackendMessage {
            role: self.role,
            content: self.content.clone(),
            timestamp: self
                .created_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| self.created_at.to_string()),
        }
    }

    /// Creation time as milliseconds since the Unix epoch.
    pub fn created_at_millis(&self) -> i64 {
        (self.created_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Parse a backend timestamp, falling back to now when it cannot be read.
///
/// Accepts RFC 3339, ISO 8601 without an offset (read as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> OffsetDateTime {
    let raw = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return ts;
    }
    if let Ok(ts) = PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT) {
        return ts.assume_utc();
    }
    if let Ok(date) = Date::parse(raw, format_description!("[year]-[month]-[day]")) {
        return date.midnight().assume_utc();
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(timestamp = raw, "unparseable timestamp; using now");
    OffsetDateTime::now_utc()
}

/// Message as the backend sends it in replies and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
}

/// Role/content pair sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTurn {
    pub role: Role,
    pub content: String,
}

impl WireTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

impl From<&Message> for WireTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub messages: Vec<WireTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(session_id: Option<String>, messages: Vec<WireTurn>) -> Self {
        Self {
            session_id,
            messages,
            context: None,
            stream: false,
        }
    }

    pub fn with_context(mut self, context: Option<Map<String, Value>>) -> Self {
        self.context = context;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.messages.is_empty() {
            return Err(ValidationError::new("at least one message is required")
                .with_field("messages")
                .into());
        }
        Ok(())
    }
}

/// Envelope returned by a non-streaming `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub session_id: String,
    pub reply: BackendMessage,
    pub history: Vec<BackendMessage>,
}
