//! Frame normalization and subscriber dispatch.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::frame::RawEvent;
use crate::types::{Channel, Error, Event, EventMeta, Snapshot};

const DEFAULT_EVENT_TYPE: &str = "message";

pub type EventCallback = Box<dyn FnMut(&Event) + Send>;
pub type OpenCallback = Box<dyn FnMut() + Send>;
pub type ErrorCallback = Box<dyn FnMut(&Error, u32) + Send>;
pub type StateCallback = Box<dyn FnMut(&Snapshot) + Send>;

/// Callbacks invoked by a connection, all from its single control task.
///
/// A panicking callback is caught and logged; it never affects the
/// connection or the remaining callbacks.
#[derive(Default)]
pub struct Subscribers {
    pub(crate) on_open: Option<OpenCallback>,
    pub(crate) on_message: Option<EventCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_state: Option<StateCallback>,
    pub(crate) typed: HashMap<Channel, EventCallback>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Catch-all: receives every accepted event regardless of type.
    pub fn on_message(mut self, f: impl FnMut(&Event) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Receives every transport failure and stall with the attempt number at
    /// the time of failure.
    pub fn on_error(mut self, f: impl FnMut(&Error, u32) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_state(mut self, f: impl FnMut(&Snapshot) + Send + 'static) -> Self {
        self.on_state = Some(Box::new(f));
        self
    }

    /// Receives events whose type maps to `channel`. Replaces any earlier
    /// callback for the same channel.
    pub fn on(mut self, channel: Channel, f: impl FnMut(&Event) + Send + 'static) -> Self {
        self.typed.insert(channel, Box::new(f));
        self
    }
}

/// Run a subscriber callback, containing any panic. Returns `false` if it panicked.
pub(crate) fn guarded(callback: &'static str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(cause) => {
            let message = cause
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(callback, cause = %message, "Subscriber callback panicked");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Keepalive markers sent only to stop proxies from timing out the stream.
const KEEPALIVE_MARKERS: &[&str] = &[
    "ping",
    "\u{2665}",
    ":keepalive",
    ": keepalive",
    ":hello",
    ": hello",
];

/// Exact match against the keepalive markers. Anything else, including a
/// padded or quoted marker, is application data.
pub fn is_keepalive(data: &str) -> bool {
    KEEPALIVE_MARKERS.contains(&data)
}

/// Converts a raw frame into an [`Event`]. Returns `None` for keepalives.
pub fn normalize(raw: &RawEvent) -> Option<Event> {
    if is_keepalive(&raw.data) {
        return None;
    }
    let payload = match serde_json::from_str::<Value>(&raw.data) {
        Ok(value) => value,
        Err(_) => Value::String(raw.data.clone()),
    };

    let channel_name = raw
        .event
        .as_deref()
        .filter(|name| *name != DEFAULT_EVENT_TYPE);
    let event_type = match channel_name {
        Some(name) => name.to_string(),
        None => payload_type(&payload).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
    };

    Some(Event {
        event_type,
        payload,
        meta: EventMeta {
            source_event_name: channel_name.unwrap_or(DEFAULT_EVENT_TYPE).to_string(),
            last_event_id: raw.id.clone(),
        },
        received_at: Utc::now(),
    })
}

fn payload_type(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    object
        .get("type")
        .or_else(|| object.get("event"))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Bounded ring of the most recent events, shared with the connection handle.
#[derive(Clone)]
pub(crate) struct History {
    inner: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        let events = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Routes accepted events to history, the typed callback and the catch-all,
/// in that order. Callbacks are skipped once `cancel` fires.
pub(crate) struct Dispatcher {
    history: History,
    typed: HashMap<Channel, EventCallback>,
    any: Option<EventCallback>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        history: History,
        typed: HashMap<Channel, EventCallback>,
        any: Option<EventCallback>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            history,
            typed,
            any,
            cancel,
        }
    }

    /// Normalize and dispatch one frame. Returns the accepted event type, if any.
    pub fn dispatch(&mut self, raw: &RawEvent) -> Option<Channel> {
        let Some(event) = normalize(raw) else {
            tracing::debug!("Dropping keepalive frame");
            return None;
        };
        let channel = event.channel();
        tracing::debug!(event_type = %event.event_type, "Dispatching event");

        self.history.push(event.clone());
        if !self.cancel.is_cancelled()
            && let Some(callback) = self.typed.get_mut(&channel)
        {
            guarded("typed", || callback(&event));
        }
        if !self.cancel.is_cancelled()
            && let Some(callback) = self.any.as_mut()
        {
            guarded("on_message", || callback(&event));
        }
        Some(channel)
    }
}
