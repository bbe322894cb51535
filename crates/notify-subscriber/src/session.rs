//! Notification session: a connection plus debounced list refresh and
//! read/unread mutations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{Notification, NotificationApi, NotificationId};
use crate::connect::{ConnectConfig, ConnectionHandle, connect};
use crate::types::{Channel, Error, Scope};

/// Lower bound for the refresh debounce window.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(300);

/// A burst of requests is flushed after at most this many debounce windows.
const MAX_WAIT_WINDOWS: u32 = 4;

/// Keeps a local copy of the authoritative notification list in sync with
/// the stream.
///
/// A refresh is requested on every successful open, on every
/// `notification` event and after every mutation. Requests arriving within
/// the debounce window of each other collapse into one `list` call issued
/// once the window passes without a new request, or once the burst has
/// lasted four windows, whichever comes first.
pub struct NotificationSession {
    connection: ConnectionHandle,
    api: Arc<dyn NotificationApi>,
    refresh: mpsc::UnboundedSender<()>,
    items: watch::Receiver<Vec<Notification>>,
    cancel: CancellationToken,
}

impl NotificationSession {
    /// Connect and start the refresh task. `debounce` is raised to
    /// [`MIN_DEBOUNCE`] if shorter.
    pub fn start(
        mut config: ConnectConfig,
        api: Arc<dyn NotificationApi>,
        debounce: Duration,
    ) -> Result<Self, Error> {
        let debounce = debounce.max(MIN_DEBOUNCE);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let subscribers = &mut config.subscribers;
        let mut user_open = subscribers.on_open.take();
        let tx = refresh_tx.clone();
        subscribers.on_open = Some(Box::new(move || {
            let _ = tx.send(());
            if let Some(callback) = user_open.as_mut() {
                callback();
            }
        }));

        let mut user_notification = subscribers.typed.remove(&Channel::Notification);
        let tx = refresh_tx.clone();
        subscribers.typed.insert(
            Channel::Notification,
            Box::new(move |event| {
                let _ = tx.send(());
                if let Some(callback) = user_notification.as_mut() {
                    callback(event);
                }
            }),
        );

        let scope = config.options.scope;
        let connection = connect(config)?;

        let cancel = CancellationToken::new();
        let (items_tx, items_rx) = watch::channel(Vec::new());
        tokio::spawn(refresh_loop(
            api.clone(),
            scope,
            debounce,
            refresh_rx,
            items_tx,
            cancel.clone(),
        ));

        Ok(Self {
            connection,
            api,
            refresh: refresh_tx,
            items: items_rx,
            cancel,
        })
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Latest refreshed list. Empty until the first refresh completes.
    pub fn items(&self) -> Vec<Notification> {
        self.items.borrow().clone()
    }

    /// Watch list refreshes.
    pub fn subscribe_items(&self) -> watch::Receiver<Vec<Notification>> {
        self.items.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.items.borrow().iter().filter(|n| !n.read).count()
    }

    /// Request a debounced refresh.
    pub fn refresh(&self) {
        if !self.cancel.is_cancelled() {
            let _ = self.refresh.send(());
        }
    }

    pub async fn mark_read(&self, id: &NotificationId) -> Result<(), Error> {
        self.api.mark_read(id).await?;
        self.refresh();
        Ok(())
    }

    pub async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), Error> {
        self.api.mark_all_read(ids).await?;
        self.refresh();
        Ok(())
    }

    /// Stop the connection and the refresh task. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.connection.cancel();
    }
}

impl Drop for NotificationSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn refresh_loop(
    api: Arc<dyn NotificationApi>,
    scope: Scope,
    debounce: Duration,
    mut requests: mpsc::UnboundedReceiver<()>,
    items: watch::Sender<Vec<Notification>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            req = requests.recv() => {
                if req.is_none() {
                    return;
                }
            }
        }

        // Trailing debounce: every new request restarts the window, bounded
        // by the deadline taken at the first request of the burst.
        let deadline = Instant::now() + debounce * MAX_WAIT_WINDOWS;
        loop {
            let wake = (Instant::now() + debounce).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(wake) => break,
                req = requests.recv() => match req {
                    Some(()) => continue,
                    None => return,
                },
            }
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = api.list(scope) => result,
        };
        match result {
            Ok(list) => {
                tracing::debug!(count = list.len(), "Notification list refreshed");
                items.send_replace(list);
            }
            Err(e) => tracing::warn!(error = %e, "Notification refresh failed"),
        }
    }
}
