//! Resilient subscriber for one-way `text/event-stream` notification channels.
//!
//! Keeps a single server-sent event stream alive across network failures,
//! host backgrounding, credential rotation and silent server stalls, and
//! delivers normalized events to registered callbacks in arrival order.
//!
//! # Features
//! - Exponential backoff with jitter, reset on every successful open
//! - Heartbeat watchdog that forces a reconnect when the stream goes quiet
//! - Visibility gate that closes the stream while the host is backgrounded
//! - Credential resolved freshly on every open and passed as a query parameter
//! - Keepalive filtering, type classification and bounded event history
//! - Notification session with debounced REST list refresh
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), notify_subscriber::Error> {
//! use std::sync::Arc;
//! use notify_subscriber::{
//!     Channel, ConnectConfig, ConnectOptions, HttpTransport, StaticToken, Subscribers,
//! };
//!
//! let mut options = ConnectOptions::new("https://api.example.com/notifications/stream");
//! options.scope = notify_subscriber::Scope::Admin;
//!
//! let subscribers = Subscribers::new()
//!     .on(Channel::Notification, |event| println!("new: {}", event.payload))
//!     .on_error(|err, attempt| eprintln!("attempt {attempt}: {err}"));
//!
//! let config = ConnectConfig::new(options, Arc::new(HttpTransport::new()?))
//!     .credentials(Arc::new(StaticToken("secret".into())))
//!     .subscribers(subscribers);
//!
//! let handle = notify_subscriber::connect(config)?;
//! // ...
//! handle.cancel();
//! # Ok(())
//! # }
//! ```

mod api;
mod backoff;
mod connect;
mod connection;
mod credentials;
mod dispatch;
mod frame;
mod heartbeat;
mod lifecycle;
mod session;
mod state;
mod transport;
mod types;

pub use api::{Notification, NotificationApi, NotificationId, RestNotificationApi};
pub use backoff::BackoffPolicy;
pub use connect::{ConnectConfig, ConnectionHandle, connect};
pub use credentials::{CredentialProvider, StaticToken};
pub use dispatch::{Subscribers, is_keepalive, normalize};
pub use frame::{Frame, FrameDecoder, RawEvent};
pub use lifecycle::{Lifecycle, LifecycleObserver, Visibility};
pub use session::{MIN_DEBOUNCE, NotificationSession};
pub use transport::{ByteStream, HttpTransport, OpenFuture, OpenRequest, Transport};
pub use types::{
    Channel, ConnectOptions, ConnectionState, Error, Event, EventMeta, Scope, Snapshot,
    TransportError,
};
