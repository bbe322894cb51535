//! Public entry point: [`connect`] and [`ConnectionHandle`].

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connection::{Callbacks, Command, Controller, Shared};
use crate::credentials::{CredentialProvider, bare_token};
use crate::dispatch::{Dispatcher, History, Subscribers};
use crate::lifecycle::LifecycleObserver;
use crate::transport::Transport;
use crate::types::{ConnectOptions, ConnectionState, Error, Event, Snapshot};

/// Options plus the collaborators a connection is built from.
pub struct ConnectConfig {
    pub options: ConnectOptions,
    pub transport: Arc<dyn Transport>,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub lifecycle: Option<Arc<dyn LifecycleObserver>>,
    pub subscribers: Subscribers,
}

impl ConnectConfig {
    pub fn new(options: ConnectOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            transport,
            credentials: None,
            lifecycle: None,
            subscribers: Subscribers::default(),
        }
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn lifecycle(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle = Some(observer);
        self
    }

    pub fn subscribers(mut self, subscribers: Subscribers) -> Self {
        self.subscribers = subscribers;
        self
    }
}

/// Handle to a running connection.
///
/// All methods return immediately. Dropping the handle cancels the connection.
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Reopen now, resetting the attempt counter and skipping any backoff delay.
    ///
    /// While the host is hidden the reopen waits for the foreground.
    pub fn reconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Stop for good: the state is `Disposed` when this returns, and no
    /// callback starts afterwards. Safe to call more than once.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.shared.dispose();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.shared.snapshot.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Address of the live transport with the credential redacted, if one exists.
    pub fn transport(&self) -> Option<Url> {
        self.shared.transport()
    }

    /// Most recent accepted events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.shared.history.snapshot()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Start a connection.
///
/// Fails with [`Error::Configuration`] when no credential is available and
/// ambient authentication is disabled, or when called outside a Tokio
/// runtime. Transport failures after this point are never returned; they
/// are reported through `on_error` and retried.
pub fn connect(config: ConnectConfig) -> Result<ConnectionHandle, Error> {
    let ConnectConfig {
        options,
        transport,
        credentials,
        lifecycle,
        subscribers,
    } = config;

    let base_url = Url::parse(&options.url_base)?;

    let has_token = options.token.as_deref().and_then(bare_token).is_some()
        || credentials
            .as_ref()
            .and_then(|p| p.bearer_token())
            .as_deref()
            .and_then(bare_token)
            .is_some();
    if !has_token && !options.with_credentials {
        return Err(Error::Configuration(
            "no credential available and ambient authentication is disabled".to_string(),
        ));
    }

    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Configuration(format!("no async runtime: {e}")))?;

    let cancel = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let history = History::new(options.history_capacity);
    let shared = Arc::new(Shared::new(history.clone()));

    let Subscribers {
        on_open,
        on_message,
        on_error,
        on_state,
        typed,
    } = subscribers;
    let dispatcher = Dispatcher::new(history, typed, on_message, cancel.clone());
    let callbacks = Callbacks {
        on_open,
        on_error,
        on_state,
    };

    let visibility = if options.pause_when_hidden {
        lifecycle.map(|observer| observer.subscribe())
    } else {
        None
    };
    let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();

    tracing::debug!(
        url = %base_url,
        scope = %options.scope,
        with_credentials = options.with_credentials,
        "Starting connection"
    );

    let controller = Controller::new(
        options,
        base_url,
        transport,
        credentials,
        visibility,
        command_rx,
        cancel.clone(),
        shared.clone(),
        dispatcher,
        callbacks,
        seed,
    );
    runtime.spawn(controller.run());

    Ok(ConnectionHandle {
        commands: command_tx,
        cancel,
        shared,
    })
}
