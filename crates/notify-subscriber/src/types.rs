//! Public types for the notify-subscriber crate.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

pub(crate) const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000);
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub(crate) const DEFAULT_JITTER_RATIO: f64 = 0.33;
pub(crate) const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(45_000);
pub(crate) const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Routing hint appended to the stream address as `scope=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    User,
    Admin,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Admin => "admin",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options recognized by [`connect`](crate::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Stream address before query augmentation.
    pub url_base: String,
    /// Explicit credential. When `None`, the injected credential provider is asked on every open.
    pub token: Option<String>,
    pub scope: Scope,
    /// Request transport-level cookie authentication (ambient auth).
    pub with_credentials: bool,
    /// Close the stream while the host is backgrounded.
    pub pause_when_hidden: bool,
    /// Schedule reconnects after failures. When `false` a failed stream stays closed.
    pub backoff: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Stall threshold for the heartbeat watchdog. `Duration::ZERO` disables it.
    pub heartbeat_timeout: Duration,
    /// Number of recent events retained for late subscribers.
    pub history_capacity: usize,
}

impl ConnectOptions {
    pub fn new(url_base: impl Into<String>) -> Self {
        Self {
            url_base: url_base.into(),
            token: None,
            scope: Scope::User,
            with_credentials: false,
            pause_when_hidden: true,
            backoff: true,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

/// Coarse connection state reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Failed; a reconnect is scheduled.
    Error,
    /// Not connected and nothing scheduled (paused while hidden, or backoff disabled).
    Closed,
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a connection, published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub attempt: u32,
    /// Delay of the pending reconnect, when one is scheduled.
    pub retry_in: Option<Duration>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            retry_in: None,
        }
    }
}

/// Known stream channels, plus `Any` for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Message,
    Notification,
    Init,
    Error,
    Warning,
    Info,
    Any,
}

impl Channel {
    pub fn from_name(name: &str) -> Self {
        match name {
            "message" => Channel::Message,
            "notification" => Channel::Notification,
            "init" => Channel::Init,
            "error" => Channel::Error,
            "warning" => Channel::Warning,
            "info" => Channel::Info,
            _ => Channel::Any,
        }
    }
}

/// Frame metadata carried alongside a normalized event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMeta {
    /// Name of the stream channel the frame arrived on (`"message"` for the default channel).
    pub source_event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

/// A normalized inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Decoded JSON, or the raw text as a JSON string when the payload is not JSON.
    pub payload: serde_json::Value,
    pub meta: EventMeta,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn channel(&self) -> Channel {
        Channel::from_name(&self.event_type)
    }
}

/// Failures of the underlying stream. Never fatal; always followed by a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("stream closed by server")]
    Closed,

    #[error("no credential available")]
    MissingCredential,

    #[error("{0}")]
    Other(String),
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection stalled: no activity for {}ms", .idle.as_millis())]
    Stalled { idle: Duration },

    #[error("api error: {0}")]
    Api(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_policy() {
        let opts = ConnectOptions::new("https://example.test/stream");
        let policy = opts.backoff_policy();
        assert_eq!(policy.min_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert!((policy.jitter_ratio - 0.33).abs() < f64::EPSILON);
        assert_eq!(opts.heartbeat_timeout, Duration::from_millis(45_000));
        assert_eq!(opts.history_capacity, 50);
        assert!(opts.backoff);
    }

    #[test]
    fn channel_names_are_closed_with_fallback() {
        assert_eq!(Channel::from_name("notification"), Channel::Notification);
        assert_eq!(Channel::from_name("init"), Channel::Init);
        assert_eq!(Channel::from_name("booking_created"), Channel::Any);
        assert_eq!(Channel::from_name(""), Channel::Any);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = Event {
            event_type: "notification".to_string(),
            payload: serde_json::json!({"id": 1}),
            meta: EventMeta {
                source_event_name: "message".to_string(),
                last_event_id: None,
            },
            received_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notification");
        assert!(json["meta"].get("last_event_id").is_none());
    }

    #[test]
    fn stalled_error_message() {
        let err = Error::Stalled {
            idle: Duration::from_millis(46_000),
        };
        assert_eq!(err.to_string(), "connection stalled: no activity for 46000ms");
    }
}
