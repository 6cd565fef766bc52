//! Lifecycle of a group as seen by this process.

/// Connection and registration state of a [`Group`](crate::Group).
///
/// ```text
/// Disconnected → Connecting → Watching ⇄ Joined → Left
///                                 ↘        ↓     ↙
///                                  Reconnecting → Failed
/// ```
///
/// `Joined` and `Watching` are the two flavours of an active group (with
/// and without a registration of its own). `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    Disconnected,
    Connecting,
    Joined,
    Watching,
    Reconnecting,
    Left,
    Failed,
}

impl GroupState {
    /// Whether the group may list members and accept joins.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Joined | Self::Watching | Self::Left)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Failed
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: GroupState) -> bool {
        use GroupState::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Disconnected, Connecting | Watching) => true,
            (Connecting, Watching | Reconnecting) => true,
            (Watching, Joined | Reconnecting) => true,
            (Joined, Watching | Left | Reconnecting) => true,
            (Left, Joined | Reconnecting) => true,
            (Reconnecting, Joined | Watching | Left) => true,
            _ => false,
        }
    }
}
