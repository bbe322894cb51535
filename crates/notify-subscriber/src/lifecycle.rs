//! Host foreground/background signal consumed by the visibility gate.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Source of foreground/background transitions.
///
/// Each call to `subscribe` returns an independent receiver; dropping it
/// unsubscribes.
pub trait LifecycleObserver: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Visibility>;
}

/// Host-side lifecycle signal. The host calls [`set_visibility`](Self::set_visibility)
/// as its window or process moves between foreground and background.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<Visibility>,
}

impl Lifecycle {
    pub fn new(initial: Visibility) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            if *current == visibility {
                return false;
            }
            *current = visibility;
            true
        });
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

impl LifecycleObserver for Lifecycle {
    fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}
