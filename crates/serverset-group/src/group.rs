//! Group — one logical membership path in the coordination namespace.
//!
//! A `Group` registers this process as an ephemeral sequential child of
//! its path (`join`), withdraws registrations (`cancel`), and keeps them
//! alive across session expiry by re-creating them under the new session.
//! Watching the membership is handled by [`crate::watch`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serverset_coord::path::{join_path, sequence_of, validate_path};
use serverset_coord::{CoordResult, Coordinator, CreatedNode, SessionId, SessionState};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GroupConfig;
use crate::error::{FailureCause, MembershipError, MembershipResult};
use crate::session::run_session_loop;
use crate::state::GroupState;

/// Name prefix of member nodes; the coordination service appends the
/// sequence number.
pub const MEMBER_PREFIX: &str = "member_";

/// A registration owned by this process.
pub(crate) struct Registration {
    pub(crate) payload: Arc<[u8]>,
    /// The live node, or `None` while it is being re-created.
    pub(crate) node: Option<CreatedNode>,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    pub(crate) entries: BTreeMap<u64, Registration>,
    /// Set once the last registration was cancelled explicitly.
    pub(crate) left: bool,
}

impl Registry {
    fn insert(&mut self, payload: Arc<[u8]>, node: CreatedNode) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Registration {
                payload,
                node: Some(node),
            },
        );
        self.left = false;
        id
    }

    /// Whether every registration has a node owned by `session`.
    pub(crate) fn all_owned_by(&self, session: SessionId) -> bool {
        self.entries
            .values()
            .all(|r| r.node.as_ref().is_some_and(|n| n.session == session))
    }

    /// The active state matching the registrations.
    pub(crate) fn active_state(&self) -> GroupState {
        if !self.entries.is_empty() {
            GroupState::Joined
        } else if self.left {
            GroupState::Left
        } else {
            GroupState::Watching
        }
    }
}

pub(crate) struct GroupInner {
    pub(crate) client: Arc<dyn Coordinator>,
    pub(crate) path: String,
    pub(crate) config: GroupConfig,
    /// Exclusive section for joins, cancels and re-registration.
    pub(crate) registry: Mutex<Registry>,
    pub(crate) state: watch::Sender<GroupState>,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl GroupInner {
    pub(crate) fn member_prefix(&self) -> String {
        join_path(&self.path, MEMBER_PREFIX)
    }

    pub(crate) fn member_path(&self, member_id: &str) -> String {
        join_path(&self.path, member_id)
    }

    pub(crate) fn current_state(&self) -> GroupState {
        *self.state.borrow()
    }

    /// Move to `next` if the transition is legal. Returns whether the state
    /// changed.
    pub(crate) fn transition(&self, next: GroupState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });
        match previous {
            Some(from) => {
                info!(group = %self.path, ?from, to = ?next, "group state changed");
                true
            }
            None => false,
        }
    }

    /// Create a member node, bounded by the operation timeout.
    ///
    /// The create runs on its own task. If the timeout elapses first the
    /// task is left to finish and any node it creates is deleted.
    pub(crate) async fn create_member_node(
        &self,
        payload: Arc<[u8]>,
    ) -> Result<CreatedNode, FailureCause> {
        let client = self.client.clone();
        let prefix = self.member_prefix();
        let mut task = tokio::spawn(async move {
            client.create_ephemeral_sequential(&prefix, &payload).await
        });

        let limit = self.config.operation_timeout();
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result.map_err(FailureCause::from),
            Ok(Err(e)) => {
                warn!(group = %self.path, error = %e, "member creation task failed");
                Err(FailureCause::TaskFailed(e.to_string()))
            }
            Err(_) => {
                self.abandon_creation(task);
                Err(FailureCause::Timeout(limit))
            }
        }
    }

    fn abandon_creation(&self, task: JoinHandle<CoordResult<CreatedNode>>) {
        let client = self.client.clone();
        let group = self.path.clone();
        tokio::spawn(async move {
            if let Ok(Ok(node)) = task.await {
                warn!(%group, member = %node.name, "removing member node acknowledged after timeout");
                delete_quietly(client.as_ref(), &group, &node.path).await;
            }
        });
    }

    /// Wait until the group is active, the caller interrupts, or the
    /// connect timeout elapses.
    async fn await_active(&self, interrupt: &CancellationToken) -> MembershipResult<()> {
        let mut state = self.state.subscribe();
        let limit = self.config.connect_timeout();
        let wait = async {
            state
                .wait_for(|s| s.is_active() || s.is_terminal())
                .await
                .map(|s| *s)
        };

        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(MembershipError::Interrupted),
            result = tokio::time::timeout(limit, wait) => match result {
                Err(_) => Err(MembershipError::join(&self.path, FailureCause::NotConnected(limit))),
                Ok(Err(_)) => Err(MembershipError::join(&self.path, FailureCause::GroupFailed)),
                Ok(Ok(s)) if s.is_terminal() => {
                    Err(MembershipError::join(&self.path, FailureCause::GroupFailed))
                }
                Ok(Ok(_)) => Ok(()),
            },
        }
    }
}

/// Delete a node, treating a missing node as success and logging failures.
pub(crate) async fn delete_quietly(client: &dyn Coordinator, group: &str, path: &str) {
    match client.delete(path).await {
        Ok(()) => {}
        Err(e) if e.is_no_node() => {}
        Err(e) => warn!(%group, %path, error = %e, "failed to remove member node"),
    }
}

/// Keep only member node names and order them by sequence number.
pub(crate) fn sorted_member_ids(names: Vec<String>) -> Vec<String> {
    let mut ids: Vec<(u64, String)> = names
        .into_iter()
        .filter(|name| name.starts_with(MEMBER_PREFIX))
        .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
        .collect();
    ids.sort();
    ids.into_iter().map(|(_, name)| name).collect()
}

/// A membership path in the coordination namespace.
///
/// Cheap to clone; clones share registrations and state. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct Group {
    pub(crate) inner: Arc<GroupInner>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("path", &self.inner.path)
            .field("state", &self.inner.current_state())
            .finish()
    }
}

impl Group {
    /// Create a group for `path` and start following the client's session.
    pub fn new(
        client: Arc<dyn Coordinator>,
        path: impl Into<String>,
        config: GroupConfig,
    ) -> CoordResult<Self> {
        let path = path.into();
        validate_path(&path)?;

        let events = client.session_events();
        let initial = client.session_state();
        let (state, _) = watch::channel(GroupState::Disconnected);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(GroupInner {
            client,
            path,
            config,
            registry: Mutex::new(Registry::default()),
            state,
            shutdown: shutdown.clone(),
        });

        match initial {
            SessionState::Connected(_) => {
                inner.transition(GroupState::Watching);
            }
            SessionState::Disconnected => {
                inner.transition(GroupState::Connecting);
            }
            SessionState::Closed => {
                inner.transition(GroupState::Failed);
            }
        }

        tokio::spawn(run_session_loop(Arc::downgrade(&inner), events, shutdown));
        debug!(group = %inner.path, "group created");
        Ok(Self { inner })
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn config(&self) -> &GroupConfig {
        &self.inner.config
    }

    pub fn state(&self) -> GroupState {
        self.inner.current_state()
    }

    /// Receive every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<GroupState> {
        self.inner.state.subscribe()
    }

    /// Register this process in the group with an opaque payload.
    ///
    /// Waits for a connected session (bounded by `connect_timeout`) and for
    /// the node creation to be acknowledged (bounded by
    /// `operation_timeout`). Cancelling `interrupt` returns
    /// [`MembershipError::Interrupted`]; a node that lands after the caller
    /// gave up is deleted again. Dropping the returned future behaves the
    /// same way.
    pub async fn join(
        &self,
        payload: Vec<u8>,
        interrupt: &CancellationToken,
    ) -> MembershipResult<Membership> {
        let inner = &self.inner;
        inner.await_active(interrupt).await?;

        let limit = inner.config.operation_timeout();
        let ensured = tokio::select! {
            biased;
            _ = interrupt.cancelled() => return Err(MembershipError::Interrupted),
            result = tokio::time::timeout(limit, inner.client.ensure_path(&inner.path)) => result,
        };
        match ensured {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MembershipError::join(&inner.path, e)),
            Err(_) => return Err(MembershipError::join(&inner.path, FailureCause::Timeout(limit))),
        }

        let (tx, mut rx) = oneshot::channel();
        let group = self.clone();
        tokio::spawn(async move { group.register(payload.into(), tx).await });

        tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
                info!(group = %inner.path, "join interrupted");
                self.withdraw_unclaimed(&mut rx).await;
                Err(MembershipError::Interrupted)
            }
            result = &mut rx => result.unwrap_or_else(|_| {
                let cause = FailureCause::TaskFailed("registration task dropped".to_string());
                Err(MembershipError::join(&inner.path, cause))
            }),
        }
    }

    /// Close the reply channel of an interrupted join. A registration that
    /// was already handed over is cancelled; one still in flight sees the
    /// closed channel and removes its own node.
    async fn withdraw_unclaimed(&self, rx: &mut oneshot::Receiver<MembershipResult<Membership>>) {
        rx.close();
        if let Ok(Ok(membership)) = rx.try_recv() {
            if let Err(e) = self.cancel(&membership).await {
                warn!(group = %self.inner.path, error = %e, "failed to withdraw registration of interrupted join");
            }
        }
    }

    /// Create the node and record the registration, handing the membership
    /// to the waiting caller. Runs on its own task so that a caller giving
    /// up cannot strand a node: if the hand-off fails the node is removed.
    async fn register(
        self,
        payload: Arc<[u8]>,
        reply: oneshot::Sender<MembershipResult<Membership>>,
    ) {
        let inner = &self.inner;
        let mut registry = inner.registry.lock().await;

        if reply.is_closed() {
            debug!(group = %inner.path, "join abandoned before node creation");
            return;
        }
        if inner.current_state().is_terminal() {
            let _ = reply.send(Err(MembershipError::join(&inner.path, FailureCause::GroupFailed)));
            return;
        }

        let node = match inner.create_member_node(payload.clone()).await {
            Ok(node) => node,
            Err(cause) => {
                warn!(group = %inner.path, error = %cause, "failed to create member node");
                let _ = reply.send(Err(MembershipError::join(&inner.path, cause)));
                return;
            }
        };

        let previous = registry.active_state();
        let id = registry.insert(payload, node.clone());
        // If the session moved on while the create was in flight, the
        // session loop owns the state until it reconnects.
        let current = inner.client.session_state().session() == Some(node.session);
        if current {
            inner.transition(GroupState::Joined);
        }

        let membership = Membership {
            id,
            group: self.clone(),
        };
        if reply.send(Ok(membership)).is_err() {
            warn!(group = %inner.path, member = %node.name, "join abandoned after node creation; removing node");
            registry.entries.remove(&id);
            if registry.entries.is_empty() {
                registry.left = previous == GroupState::Left;
                if current {
                    inner.transition(previous);
                }
            }
            delete_quietly(inner.client.as_ref(), &inner.path, &node.path).await;
            return;
        }

        info!(group = %inner.path, member = %node.name, session = %node.session, "joined group");
    }

    /// Withdraw a registration.
    ///
    /// Deleting a node that no longer exists counts as success, and so does
    /// cancelling a membership that was already cancelled. Any other
    /// coordination failure is returned as [`MembershipError::Update`] and
    /// the registration is kept so the call can be retried.
    pub async fn cancel(&self, membership: &Membership) -> MembershipResult<()> {
        let inner = &self.inner;
        let mut registry = inner.registry.lock().await;

        let Some(entry) = registry.entries.get(&membership.id) else {
            debug!(group = %inner.path, "membership already cancelled");
            return Ok(());
        };

        let current = inner.client.session_state().session();
        if let Some(node) = &entry.node {
            // A node owned by an older session vanished with that session.
            let stale = matches!(current, Some(session) if session != node.session);
            if !stale {
                let limit = inner.config.operation_timeout();
                match tokio::time::timeout(limit, inner.client.delete(&node.path)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_no_node() => {
                        debug!(group = %inner.path, member = %node.name, "member node already gone");
                    }
                    Ok(Err(e)) => return Err(MembershipError::update(&inner.path, e)),
                    Err(_) => {
                        return Err(MembershipError::update(&inner.path, FailureCause::Timeout(limit)));
                    }
                }
            }
            info!(group = %inner.path, member = %node.name, "left group");
        }

        registry.entries.remove(&membership.id);
        if registry.entries.is_empty() {
            registry.left = true;
            if inner.current_state() == GroupState::Joined {
                inner.transition(GroupState::Left);
            }
        }
        Ok(())
    }

    /// Current member ids (node names), ordered by creation. Does not set
    /// a watch.
    pub async fn member_ids(&self) -> CoordResult<Vec<String>> {
        match self.inner.client.get_children_with_watch(&self.inner.path).await {
            Ok((names, _watch)) => Ok(sorted_member_ids(names)),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Number of registrations held by this process.
    pub async fn registrations(&self) -> usize {
        self.inner.registry.lock().await.entries.len()
    }
}

/// Handle to one registration made by [`Group::join`].
///
/// The node behind it may be re-created under a new session, so its
/// member id can change over time.
pub struct Membership {
    id: u64,
    group: Group,
}

impl fmt::Debug for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membership")
            .field("group", &self.group.path())
            .field("id", &self.id)
            .finish()
    }
}

impl Membership {
    /// The group this membership belongs to.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Current node name, or `None` once cancelled or while the node is
    /// being re-created.
    pub async fn member_id(&self) -> Option<String> {
        self.node().await.map(|n| n.name)
    }

    /// Current full node path.
    pub async fn member_path(&self) -> Option<String> {
        self.node().await.map(|n| n.path)
    }

    async fn node(&self) -> Option<CreatedNode> {
        let registry = self.group.inner.registry.lock().await;
        registry.entries.get(&self.id).and_then(|r| r.node.clone())
    }

    /// Withdraw this registration. Same as [`Group::cancel`].
    pub async fn cancel(&self) -> MembershipResult<()> {
        self.group.cancel(self).await
    }
}
