//! Connection state transition table.

use crate::types::ConnectionState;

/// Inputs that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// A transport open was started.
    Open,
    /// The transport reported a successful handshake.
    Opened,
    /// The transport failed, closed, or stalled. `retry` is whether a reconnect was scheduled.
    Failed { retry: bool },
    /// The host went to the background.
    Pause,
    Dispose,
}

/// Returns the state reached from `from` on `trigger`, or `None` if the
/// transition is not allowed. `Disposed` accepts nothing.
pub(crate) fn next_state(from: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (from, trigger) {
        (Disposed, _) => None,
        (_, Trigger::Dispose) => Some(Disposed),
        (_, Trigger::Open) => Some(Connecting),
        (Connecting, Trigger::Opened) => Some(Open),
        (Connecting | Open, Trigger::Failed { retry: true }) => Some(Error),
        (Connecting | Open, Trigger::Failed { retry: false }) => Some(Closed),
        (_, Trigger::Pause) => Some(Closed),
        _ => None,
    }
}
