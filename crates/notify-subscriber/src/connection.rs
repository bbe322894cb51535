//! Connection control loop: transport ownership, reconnection, heartbeat,
//! and the visibility gate.
//!
//! One task owns a [`Controller`]. Every state change happens inside that
//! task, in response to exactly one [`Input`] at a time, so transitions are
//! linearized and callbacks run in frame arrival order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::credentials::{CredentialProvider, bare_token};
use crate::dispatch::{Dispatcher, ErrorCallback, History, OpenCallback, StateCallback, guarded};
use crate::frame::{Frame, FrameStream, decode_frames};
use crate::heartbeat::Watchdog;
use crate::lifecycle::Visibility;
use crate::state::{Trigger, next_state};
use crate::transport::{ByteStream, OpenFuture, OpenRequest, Transport};
use crate::types::{ConnectOptions, ConnectionState, Error, Snapshot, TransportError};

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

const TOKEN_PARAM: &str = "token";
const SCOPE_PARAM: &str = "scope";
const SEED_PARAM: &str = "seed";
const REDACTED: &str = "REDACTED";

/// Append credential, scope and cache-busting seed to `base`.
///
/// Parameters with the same names already present in `base` are replaced.
pub(crate) fn build_url(base: &Url, token: Option<&str>, scope: &str, seed: u64) -> Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), TOKEN_PARAM | SCOPE_PARAM | SEED_PARAM))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = base.clone();
    url.set_query(None);
    {
        let mut q = url.query_pairs_mut();
        for (k, v) in &kept {
            q.append_pair(k, v);
        }
        if let Some(token) = token {
            q.append_pair(TOKEN_PARAM, token);
        }
        q.append_pair(SCOPE_PARAM, scope);
        q.append_pair(SEED_PARAM, &seed.to_string());
    }
    url
}

/// Copy of `url` safe for logs and observers.
pub(crate) fn redact(url: &Url) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == TOKEN_PARAM {
                REDACTED.to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    let mut redacted = url.clone();
    if pairs.is_empty() {
        return redacted;
    }
    redacted.set_query(None);
    redacted.query_pairs_mut().extend_pairs(pairs);
    redacted
}

// ---------------------------------------------------------------------------
// Shared state (read by the handle)
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub snapshot: watch::Sender<Snapshot>,
    pub transport: Mutex<Option<Url>>,
    pub history: History,
}

impl Shared {
    pub fn new(history: History) -> Self {
        let (snapshot, _rx) = watch::channel(Snapshot::default());
        Self {
            snapshot,
            transport: Mutex::new(None),
            history,
        }
    }

    pub fn set_transport(&self, url: Option<Url>) {
        *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = url;
    }

    pub fn transport(&self) -> Option<Url> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the connection disposed. Later snapshot updates are refused.
    pub fn dispose(&self) {
        self.snapshot.send_modify(|s| {
            s.state = ConnectionState::Disposed;
            s.retry_in = None;
        });
        self.set_transport(None);
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Reconnect,
}

/// What the controller currently owns. A transport exists only while
/// connecting or open; a reconnect timer only while in `Error`.
enum Phase {
    Idle,
    Connecting { pending: OpenFuture },
    Open { frames: FrameStream },
    Error { retry_at: Instant },
    Closed,
}

enum Input {
    Cancelled,
    Reconnect,
    Visibility(Visibility),
    LifecycleGone,
    Opened(Result<ByteStream, TransportError>),
    Frame(Option<Result<Frame, TransportError>>),
    RetryDue,
    HeartbeatTick,
}

pub(crate) struct Callbacks {
    pub on_open: Option<OpenCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_state: Option<StateCallback>,
}

pub(crate) struct Controller {
    options: ConnectOptions,
    base_url: Url,
    policy: BackoffPolicy,
    transport: Arc<dyn Transport>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    lifecycle: Option<watch::Receiver<Visibility>>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    callbacks: Callbacks,
    seed: u64,
    phase: Phase,
    state: ConnectionState,
    attempt: u32,
    hidden: bool,
    watchdog: Watchdog,
    ticker: Option<Interval>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: ConnectOptions,
        base_url: Url,
        transport: Arc<dyn Transport>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        lifecycle: Option<watch::Receiver<Visibility>>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        callbacks: Callbacks,
        seed: u64,
    ) -> Self {
        Self {
            policy: options.backoff_policy(),
            watchdog: Watchdog::new(options.heartbeat_timeout),
            options,
            base_url,
            transport,
            credentials,
            lifecycle,
            commands,
            cancel,
            shared,
            dispatcher,
            callbacks,
            seed,
            phase: Phase::Idle,
            state: ConnectionState::Idle,
            attempt: 0,
            hidden: false,
            ticker: None,
        }
    }

    pub async fn run(mut self) {
        self.start();
        loop {
            let input = self.next_input().await;
            if !self.handle(input) {
                break;
            }
        }
        self.dispose();
    }

    fn start(&mut self) {
        let starts_hidden = self
            .lifecycle
            .as_mut()
            .is_some_and(|rx| *rx.borrow_and_update() == Visibility::Hidden);
        if starts_hidden {
            tracing::info!("Host is hidden, deferring open");
            self.hidden = true;
            self.enter(Trigger::Pause, Phase::Closed, None);
            return;
        }
        self.open();
    }

    async fn next_input(&mut self) -> Input {
        let Self {
            phase,
            ticker,
            lifecycle,
            commands,
            cancel,
            ..
        } = self;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Input::Cancelled,
            cmd = commands.recv() => match cmd {
                Some(Command::Reconnect) => Input::Reconnect,
                None => Input::Cancelled,
            },
            input = visibility_change(lifecycle) => input,
            input = phase_input(phase) => input,
            _ = heartbeat_tick(ticker) => Input::HeartbeatTick,
        }
    }

    /// Apply one input. Returns `false` once the connection is cancelled.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Cancelled => return false,
            Input::Reconnect => self.reconnect(),
            Input::Visibility(visibility) => self.on_visibility(visibility),
            Input::LifecycleGone => {
                tracing::debug!("Lifecycle source dropped, visibility gate disabled");
                self.lifecycle = None;
            }
            Input::Opened(Ok(bytes)) => self.on_opened(bytes),
            Input::Opened(Err(e)) => self.fail(Error::Transport(e)),
            Input::Frame(Some(Ok(frame))) => self.on_frame(frame),
            Input::Frame(Some(Err(e))) => self.fail(Error::Transport(e)),
            Input::Frame(None) => self.fail(Error::Transport(TransportError::Closed)),
            Input::RetryDue => self.open(),
            Input::HeartbeatTick => self.check_heartbeat(),
        }
        !self.cancel.is_cancelled()
    }

    // -- transitions --------------------------------------------------------

    fn enter(&mut self, trigger: Trigger, phase: Phase, retry_in: Option<Duration>) -> bool {
        let Some(next) = next_state(self.state, trigger) else {
            tracing::debug!(state = %self.state, ?trigger, "Ignoring transition");
            return false;
        };
        self.state = next;
        self.phase = phase;
        self.publish(retry_in);
        true
    }

    fn publish(&mut self, retry_in: Option<Duration>) {
        let snapshot = Snapshot {
            state: self.state,
            attempt: self.attempt,
            retry_in,
        };
        let changed = self.shared.snapshot.send_if_modified(|current| {
            if current.state == ConnectionState::Disposed || *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        if changed
            && !self.cancel.is_cancelled()
            && let Some(callback) = self.callbacks.on_state.as_mut()
        {
            guarded("on_state", || callback(&snapshot));
        }
    }

    /// Drop the transport and all timers.
    fn teardown(&mut self) {
        if matches!(self.phase, Phase::Connecting { .. } | Phase::Open { .. }) {
            tracing::debug!("Closing transport");
        }
        self.phase = Phase::Closed;
        self.ticker = None;
        self.shared.set_transport(None);
    }

    fn resolve_token(&self) -> Option<String> {
        if let Some(token) = self.options.token.as_deref().and_then(bare_token) {
            return Some(token);
        }
        let raw = self.credentials.as_ref()?.bearer_token()?;
        bare_token(&raw)
    }

    /// Replace any existing transport with a freshly addressed one.
    fn open(&mut self) {
        self.teardown();
        if self.hidden {
            tracing::debug!("Open requested while hidden, waiting for foreground");
            return;
        }

        self.seed = self.seed.wrapping_add(1);
        let token = self.resolve_token();
        let url = build_url(
            &self.base_url,
            token.as_deref(),
            self.options.scope.as_str(),
            self.seed,
        );
        let redacted = redact(&url);

        let pending: OpenFuture = if token.is_none() && !self.options.with_credentials {
            tracing::warn!(attempt = self.attempt, "No credential available, not opening");
            Box::pin(futures_util::future::ready(Err(
                TransportError::MissingCredential,
            )))
        } else {
            tracing::info!(url = %redacted, attempt = self.attempt, "Opening stream");
            self.shared.set_transport(Some(redacted));
            self.transport.open(OpenRequest {
                url,
                with_credentials: self.options.with_credentials,
            })
        };

        self.watchdog.beat();
        if self.enter(Trigger::Open, Phase::Connecting { pending }, None) {
            self.ticker = self.watchdog.ticker();
        }
    }

    fn on_opened(&mut self, bytes: ByteStream) {
        if !matches!(self.phase, Phase::Connecting { .. }) {
            return;
        }
        self.attempt = 0;
        self.watchdog.beat();
        let frames = decode_frames(bytes);
        if !self.enter(Trigger::Opened, Phase::Open { frames }, None) {
            return;
        }
        tracing::info!("Stream open");
        if !self.cancel.is_cancelled()
            && let Some(callback) = self.callbacks.on_open.as_mut()
        {
            guarded("on_open", callback);
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        self.watchdog.beat();
        match frame {
            Frame::Comment(comment) => {
                tracing::trace!(comment = %comment, "Stream comment");
            }
            Frame::Event(raw) => {
                if let Some(retry_ms) = raw.retry {
                    tracing::debug!(retry_ms, "Server suggested retry interval (ignored)");
                }
                self.dispatcher.dispatch(&raw);
            }
        }
    }

    /// Report a failure and schedule the next attempt.
    fn fail(&mut self, error: Error) {
        tracing::warn!(attempt = self.attempt, error = %error, "Stream failed");
        if !self.cancel.is_cancelled()
            && let Some(callback) = self.callbacks.on_error.as_mut()
        {
            let attempt = self.attempt;
            guarded("on_error", || callback(&error, attempt));
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.teardown();
        if !self.options.backoff {
            tracing::info!("Reconnect disabled, stream stays closed");
            self.enter(Trigger::Failed { retry: false }, Phase::Closed, None);
            return;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay(self.attempt);
        tracing::info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let retry_at = Instant::now() + delay;
        self.enter(
            Trigger::Failed { retry: true },
            Phase::Error { retry_at },
            Some(delay),
        );
    }

    fn reconnect(&mut self) {
        tracing::info!("Reconnect requested");
        self.attempt = 0;
        if self.hidden {
            self.publish(None);
            return;
        }
        self.open();
    }

    fn on_visibility(&mut self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden if !self.hidden => {
                tracing::info!("Host hidden, pausing stream");
                self.hidden = true;
                self.teardown();
                self.enter(Trigger::Pause, Phase::Closed, None);
            }
            Visibility::Visible if self.hidden => {
                tracing::info!("Host visible, resuming stream");
                self.hidden = false;
                self.attempt = 0;
                self.open();
            }
            _ => {}
        }
    }

    fn check_heartbeat(&mut self) {
        if !matches!(self.phase, Phase::Connecting { .. } | Phase::Open { .. }) {
            return;
        }
        if let Some(idle) = self.watchdog.stalled(Instant::now()) {
            self.fail(Error::Stalled { idle });
        }
    }

    fn dispose(mut self) {
        self.teardown();
        if let Some(to) = next_state(self.state, Trigger::Dispose) {
            tracing::info!(from = %self.state, to = %to, "Connection disposed");
        }
        self.shared.dispose();
    }
}

async fn visibility_change(lifecycle: &mut Option<watch::Receiver<Visibility>>) -> Input {
    match lifecycle {
        Some(rx) => match rx.changed().await {
            Ok(()) => Input::Visibility(*rx.borrow_and_update()),
            Err(_) => Input::LifecycleGone,
        },
        None => std::future::pending().await,
    }
}

async fn phase_input(phase: &mut Phase) -> Input {
    match phase {
        Phase::Connecting { pending, .. } => Input::Opened(pending.await),
        Phase::Open { frames, .. } => Input::Frame(frames.next().await),
        Phase::Error { retry_at } => {
            tokio::time::sleep_until(*retry_at).await;
            Input::RetryDue
        }
        Phase::Idle | Phase::Closed => std::future::pending().await,
    }
}

async fn heartbeat_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
