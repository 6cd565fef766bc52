//! Session, node, and watch types shared by every coordination client.

use std::fmt;

use tokio::sync::oneshot;

/// Identifier of a coordination service session.
///
/// Ephemeral nodes are owned by exactly one session and disappear when
/// it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Current connectivity of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected with a live session.
    Connected(SessionId),
    /// Connection lost; the session may or may not still be alive.
    Disconnected,
    /// The client was shut down and will never reconnect.
    Closed,
}

impl SessionState {
    /// The live session, if connected.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Connected(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Notifications published by a client as its session changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session is connected. A different id than the previous
    /// `Connected` event means the old session expired in between.
    Connected(SessionId),
    /// The connection dropped and the client is trying to re-establish it.
    Reconnecting,
    /// The session expired; every ephemeral node it owned is gone.
    Expired(SessionId),
    /// The client was closed.
    Closed,
}

/// Result of creating a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    /// Full path of the created node.
    pub path: String,
    /// Final path segment, including any sequence suffix.
    pub name: String,
    /// Session that owns the node.
    pub session: SessionId,
}

/// Outcome of a one-shot child watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The set of children changed.
    ChildrenChanged,
    /// The session that set the watch is gone; the watch will never fire.
    SessionLost,
}

/// A one-shot watch on the children of a node.
///
/// Watches do not repeat: after it resolves the caller must list the
/// children again to arm a new one.
#[derive(Debug)]
pub struct ChildWatch {
    rx: oneshot::Receiver<WatchEvent>,
}

/// The firing side of a [`ChildWatch`], held by the client implementation.
#[derive(Debug)]
pub struct WatchTrigger {
    tx: oneshot::Sender<WatchEvent>,
}

impl ChildWatch {
    /// Create a connected watch/trigger pair.
    pub fn channel() -> (WatchTrigger, ChildWatch) {
        let (tx, rx) = oneshot::channel();
        (WatchTrigger { tx }, ChildWatch { rx })
    }

    /// Wait for the watch to fire.
    ///
    /// A trigger dropped without firing counts as `SessionLost`.
    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionLost)
    }
}

impl WatchTrigger {
    /// Fire the watch. Firing a watch nobody awaits is not an error.
    pub fn fire(self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Whether the watching side is still interested.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
