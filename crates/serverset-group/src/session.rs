//! Session event handling — drives the group state machine and re-creates
//! member nodes lost to session expiry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serverset_coord::{SessionEvent, SessionId, SessionState};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FailureCause;
use crate::group::{GroupInner, delete_quietly};
use crate::state::GroupState;

enum Recreate {
    Created(serverset_coord::CreatedNode),
    /// The session moved on while re-creating; a later `Connected` event
    /// will retry.
    Superseded,
    Failed(FailureCause),
}

/// Follow the client's session events until the group is dropped or the
/// client closes.
pub(crate) async fn run_session_loop(
    inner: Weak<GroupInner>,
    mut events: broadcast::Receiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(group) = inner.upgrade() else {
            break;
        };

        match event {
            Ok(SessionEvent::Connected(session)) => group.on_connected(session).await,
            Ok(SessionEvent::Reconnecting) => {
                group.transition(GroupState::Reconnecting);
            }
            Ok(SessionEvent::Expired(session)) => {
                warn!(group = %group.path, %session, "session expired");
                group.transition(GroupState::Reconnecting);
            }
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                group.fail("coordination client closed");
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(group = %group.path, skipped, "missed session events; resynchronising");
                group.resync().await;
            }
        }

        if group.current_state().is_terminal() {
            break;
        }
    }
    debug!("group session loop stopped");
}

/// Sleep for `delay` unless shut down first. Returns false on shutdown.
pub(crate) async fn backoff(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl GroupInner {
    /// A session is connected: re-create every registration whose node
    /// belonged to an earlier session, then become active again.
    ///
    /// The registry lock is taken per entry, not across re-creation, so
    /// joins and cancels proceed while the coordination service is slow.
    /// An entry being re-created has no node and keeps listings gated.
    pub(crate) async fn on_connected(&self, session: SessionId) {
        if self.current_state().is_terminal() {
            return;
        }

        let mut announced = false;
        loop {
            let next = {
                let mut registry = self.registry.lock().await;
                registry
                    .entries
                    .iter_mut()
                    .find(|(_, r)| !r.node.as_ref().is_some_and(|n| n.session == session))
                    .map(|(id, entry)| {
                        entry.node = None;
                        (*id, entry.payload.clone())
                    })
            };
            let Some((id, payload)) = next else {
                break;
            };
            if !announced {
                info!(group = %self.path, %session, "re-registering members under new session");
                announced = true;
            }

            match self.recreate(payload, session).await {
                Recreate::Created(node) => {
                    let mut registry = self.registry.lock().await;
                    if let Some(entry) = registry.entries.get_mut(&id) {
                        info!(group = %self.path, member = %node.name, %session, "member re-registered");
                        entry.node = Some(node);
                    } else {
                        drop(registry);
                        debug!(group = %self.path, member = %node.name, "membership cancelled during re-registration; removing node");
                        delete_quietly(self.client.as_ref(), &self.path, &node.path).await;
                    }
                }
                Recreate::Superseded => {
                    debug!(group = %self.path, %session, "session changed during re-registration");
                    return;
                }
                Recreate::Failed(cause) => {
                    self.fail(&format!("re-registration failed: {cause}"));
                    return;
                }
            }
        }

        let next = self.registry.lock().await.active_state();
        self.transition(next);
    }

    async fn recreate(&self, payload: Arc<[u8]>, session: SessionId) -> Recreate {
        let attempts = self.config.reregister_attempts();
        let mut last = FailureCause::GroupFailed;

        for attempt in 1..=attempts {
            if self.client.session_state().session() != Some(session) {
                return Recreate::Superseded;
            }

            let result = match self.client.ensure_path(&self.path).await {
                Ok(()) => self.create_member_node(payload.clone()).await,
                Err(e) => Err(FailureCause::from(e)),
            };
            match result {
                Ok(node) => return Recreate::Created(node),
                Err(cause) if cause.is_permanent() => {
                    warn!(group = %self.path, attempt, error = %cause, "member node cannot be re-created");
                    return Recreate::Failed(cause);
                }
                Err(cause) => {
                    warn!(group = %self.path, attempt, attempts, error = %cause, "failed to re-create member node");
                    last = cause;
                }
            }

            if attempt < attempts && !backoff(self.config.retry_backoff(), &self.shutdown).await {
                return Recreate::Superseded;
            }
        }

        Recreate::Failed(last)
    }

    /// Enter the terminal `Failed` state.
    pub(crate) fn fail(&self, reason: &str) {
        if self.transition(GroupState::Failed) {
            error!(group = %self.path, reason, "group failed; membership is indeterminate");
        }
    }

    async fn resync(&self) {
        match self.client.session_state() {
            SessionState::Connected(session) => self.on_connected(session).await,
            SessionState::Disconnected => {
                self.transition(GroupState::Reconnecting);
            }
            SessionState::Closed => self.fail("coordination client closed"),
        }
    }
}
