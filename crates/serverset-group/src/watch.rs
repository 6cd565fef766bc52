//! Group watch — keeps a live listing of the group's members.
//!
//! Each call to [`Group::watch`] spawns a listing loop. The loop lists the
//! member nodes, reads their payloads, hands the result to the listener,
//! and re-arms the one-shot child watch. A watch firing while a listing is
//! in flight is absorbed by the next listing, so events coalesce.
//!
//! Listings only run while the group is active and every registration of
//! this process is owned by the current session. While a lost member node
//! is being re-created nothing is delivered, so the listener never sees
//! the transient listing that lacks this process's own member.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serverset_coord::{ChildWatch, CoordError, CoordResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::group::{Group, sorted_member_ids};
use crate::session::backoff;

/// One member node and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub id: String,
    pub data: Arc<[u8]>,
}

/// Updates delivered to a group watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// The members present at the time of a listing, ordered by creation.
    Members(Vec<GroupMember>),
    /// The group failed; membership can no longer be observed.
    Indeterminate,
}

/// Handle to a running listing loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct WatchHandle {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl WatchHandle {
    /// Stop the listing loop.
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

impl Group {
    /// Start watching the group's members. Every distinct listing is sent
    /// to `listener` in the order the listings happened.
    pub fn watch(&self, listener: mpsc::UnboundedSender<GroupEvent>) -> WatchHandle {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_listing_loop(self.clone(), listener, shutdown.clone()));
        debug!(group = %self.path(), "group watch started");
        WatchHandle { task, shutdown }
    }

    /// Whether a listing taken now would reflect this process's own
    /// registrations: connected, and every node owned by the live session.
    async fn registrations_current(&self) -> bool {
        let Some(session) = self.inner.client.session_state().session() else {
            return false;
        };
        self.inner.registry.lock().await.all_owned_by(session)
    }

    async fn list_members(
        &self,
        cache: &mut HashMap<String, Arc<[u8]>>,
    ) -> CoordResult<(Vec<GroupMember>, ChildWatch)> {
        let inner = &self.inner;
        let client = inner.client.as_ref();

        let (names, watch) = match client.get_children_with_watch(&inner.path).await {
            Err(CoordError::NoNode(_)) => {
                client.ensure_path(&inner.path).await?;
                client.get_children_with_watch(&inner.path).await?
            }
            other => other?,
        };

        let ids = sorted_member_ids(names);
        let present: HashSet<&String> = ids.iter().collect();
        cache.retain(|id, _| present.contains(id));

        let mut members = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(data) = cache.get(id) {
                members.push(GroupMember {
                    id: id.clone(),
                    data: data.clone(),
                });
                continue;
            }
            match client.get_data(&inner.member_path(id)).await {
                Ok(data) => {
                    let data: Arc<[u8]> = data.into();
                    cache.insert(id.clone(), data.clone());
                    members.push(GroupMember {
                        id: id.clone(),
                        data,
                    });
                }
                // Left between the listing and the read; the watch has fired.
                Err(e) if e.is_no_node() => {
                    debug!(group = %inner.path, member = %id, "member vanished before its payload was read");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((members, watch))
    }
}

async fn run_listing_loop(
    group: Group,
    listener: mpsc::UnboundedSender<GroupEvent>,
    shutdown: CancellationToken,
) {
    let path = group.path().to_string();
    let retry = group.config().retry_backoff();
    let mut state = group.subscribe_state();
    let mut cache: HashMap<String, Arc<[u8]>> = HashMap::new();
    let mut last_ids: Option<Vec<String>> = None;

    loop {
        let gate = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = listener.closed() => break,
            result = state.wait_for(|s| s.is_active() || s.is_terminal()) => result.map(|s| *s),
        };
        match gate {
            Err(_) => break,
            Ok(s) if s.is_terminal() => {
                warn!(group = %path, "group failed; membership is indeterminate");
                let _ = listener.send(GroupEvent::Indeterminate);
                break;
            }
            Ok(_) => {}
        }

        if !group.registrations_current().await {
            debug!(group = %path, "own registrations not yet current; deferring listing");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = state.changed() => if changed.is_err() { break },
                _ = tokio::time::sleep(retry) => {}
            }
            continue;
        }

        let listing = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = group.list_members(&mut cache) => result,
        };

        match listing {
            Ok((members, watch)) => {
                // The session may have expired mid-listing; such a listing
                // can be missing this process's own members.
                if !group.registrations_current().await {
                    continue;
                }

                let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
                if last_ids.as_ref() != Some(&ids) {
                    debug!(group = %path, members = ids.len(), "group membership changed");
                    if listener.send(GroupEvent::Members(members)).is_err() {
                        break;
                    }
                    last_ids = Some(ids);
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = watch.fired() => debug!(group = %path, ?event, "group watch fired"),
                    changed = state.changed() => if changed.is_err() { break },
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!(group = %path, error = %e, "listing interrupted by a connection fault; retrying");
                } else {
                    warn!(group = %path, error = %e, "failed to list group members; retrying");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = state.changed() => if changed.is_err() { break },
                    ok = backoff(retry, &shutdown) => if !ok { break },
                }
            }
        }
    }
    debug!(group = %path, "group watch stopped");
}
