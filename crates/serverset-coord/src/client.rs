//! The coordination client facade consumed by the membership layer.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::CoordResult;
use crate::types::{ChildWatch, CreatedNode, SessionEvent, SessionState};

/// Client for a hierarchical, watch-capable coordination service.
///
/// Implementations own connection management and session renewal. The
/// membership layer only needs the primitives below plus a stream of
/// session events.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Current connectivity.
    fn session_state(&self) -> SessionState;

    /// Subscribe to session events. Events published before the call are
    /// not replayed; read [`Coordinator::session_state`] after subscribing.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Create `path` and any missing parents as persistent nodes.
    /// Nodes that already exist are left alone.
    async fn ensure_path(&self, path: &str) -> CoordResult<()>;

    /// Create an ephemeral node named `prefix_path` plus a monotonically
    /// increasing sequence suffix, owned by the current session.
    async fn create_ephemeral_sequential(
        &self,
        prefix_path: &str,
        data: &[u8],
    ) -> CoordResult<CreatedNode>;

    /// Delete a node. Fails with `NoNode` if it does not exist.
    async fn delete(&self, path: &str) -> CoordResult<()>;

    /// List the children of `path` and arm a one-shot watch for the next
    /// change to that list.
    async fn get_children_with_watch(&self, path: &str)
    -> CoordResult<(Vec<String>, ChildWatch)>;

    /// Read the payload stored at `path`.
    async fn get_data(&self, path: &str) -> CoordResult<Vec<u8>>;
}
