//! In-process coordination ensemble.
//!
//! `InMemoryEnsemble` keeps a hierarchical namespace shared by any number
//! of `MemoryClient`s, each owning one session at a time. It implements
//! the semantics the membership layer relies on (ephemeral sequential
//! nodes, one-shot child watches, session expiry) and exposes fault
//! injection hooks for disconnects, expiry, write rejection and latency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::client::Coordinator;
use crate::error::{CoordError, CoordResult};
use crate::path::{join_path, node_name, parent_of, sequential_name, validate_path};
use crate::types::{
    ChildWatch, CreatedNode, SessionEvent, SessionId, SessionState, WatchEvent, WatchTrigger,
};

/// Capacity of each client's session event channel.
const EVENT_CAPACITY: usize = 64;

struct ZNode {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

struct PendingWatch {
    session: SessionId,
    trigger: WatchTrigger,
}

struct Namespace {
    nodes: BTreeMap<String, ZNode>,
    child_watches: HashMap<String, Vec<PendingWatch>>,
    live_sessions: HashSet<SessionId>,
    next_session: u64,
    rejected_writes: Option<String>,
}

impl Namespace {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));
        Self {
            nodes,
            child_watches: HashMap::new(),
            live_sessions: HashSet::new(),
            next_session: 1,
            rejected_writes: None,
        }
    }

    fn open_session(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.live_sessions.insert(id);
        id
    }

    fn check_session(&self, session: SessionId) -> CoordResult<()> {
        if self.live_sessions.contains(&session) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired)
        }
    }

    fn check_writable(&self) -> CoordResult<()> {
        match &self.rejected_writes {
            Some(reason) => Err(CoordError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn create(&mut self, path: &str, data: Vec<u8>, owner: Option<SessionId>) -> CoordResult<()> {
        let parent = parent_of(path).ok_or_else(|| CoordError::NodeExists(path.to_string()))?;
        match self.nodes.get(parent) {
            None => return Err(CoordError::NoNode(parent.to_string())),
            Some(node) if node.owner.is_some() => {
                return Err(CoordError::Rejected(format!(
                    "ephemeral node {parent} cannot have children"
                )));
            }
            Some(_) => {}
        }
        if self.nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        self.nodes.insert(path.to_string(), ZNode::new(data, owner));
        self.fire_child_watches(parent);
        Ok(())
    }

    fn create_sequential(
        &mut self,
        prefix_path: &str,
        data: Vec<u8>,
        owner: SessionId,
    ) -> CoordResult<String> {
        let parent = parent_of(prefix_path)
            .ok_or_else(|| CoordError::InvalidPath(prefix_path.to_string()))?;
        let prefix = node_name(prefix_path);
        let sequence = match self.nodes.get_mut(parent) {
            Some(node) => {
                let seq = node.next_sequence;
                node.next_sequence += 1;
                seq
            }
            None => return Err(CoordError::NoNode(parent.to_string())),
        };
        let path = join_path(parent, &sequential_name(prefix, sequence));
        self.create(&path, data, Some(owner))?;
        Ok(path)
    }

    fn ensure_path(&mut self, path: &str) -> CoordResult<()> {
        if self.nodes.contains_key(path) {
            return Ok(());
        }
        if let Some(parent) = parent_of(path) {
            self.ensure_path(parent)?;
        }
        self.check_writable()?;
        match self.create(path, Vec::new(), None) {
            Ok(()) | Err(CoordError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delete(&mut self, path: &str) -> CoordResult<()> {
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(CoordError::Rejected(format!("{path} has children")));
        }
        self.nodes.remove(path);
        if let Some(parent) = parent_of(path) {
            self.fire_child_watches(parent);
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn watch_children(&mut self, path: &str, session: SessionId) -> ChildWatch {
        let (trigger, watch) = ChildWatch::channel();
        let pending = self.child_watches.entry(path.to_string()).or_default();
        pending.retain(|w| !w.trigger.is_closed());
        pending.push(PendingWatch { session, trigger });
        watch
    }

    fn fire_child_watches(&mut self, path: &str) {
        if let Some(pending) = self.child_watches.remove(path) {
            for watch in pending {
                watch.trigger.fire(WatchEvent::ChildrenChanged);
            }
        }
    }

    /// Expire a session: its watches are lost, then its ephemeral nodes
    /// are removed (firing the watches of other sessions).
    fn expire(&mut self, session: SessionId) -> usize {
        if !self.live_sessions.remove(&session) {
            return 0;
        }

        for pending in self.child_watches.values_mut() {
            let (lost, kept): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|w| w.session == session);
            *pending = kept;
            for watch in lost {
                watch.trigger.fire(WatchEvent::SessionLost);
            }
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.nodes.remove(path);
            if let Some(parent) = parent_of(path) {
                self.fire_child_watches(parent);
            }
        }
        owned.len()
    }
}

/// A shared in-process namespace.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    namespace: Arc<Mutex<Namespace>>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnsemble {
    pub fn new() -> Self {
        Self {
            namespace: Arc::new(Mutex::new(Namespace::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Namespace> {
        self.namespace.lock().expect("namespace lock")
    }

    /// Open a new client with a fresh, connected session.
    pub fn connect(&self) -> Arc<MemoryClient> {
        self.connect_with_latency(Duration::ZERO)
    }

    /// Open a client whose every operation waits `latency` before it is
    /// applied to the namespace.
    pub fn connect_with_latency(&self, latency: Duration) -> Arc<MemoryClient> {
        let session = self.lock().open_session();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        debug!(%session, "in-memory session opened");
        Arc::new(MemoryClient {
            ensemble: self.clone(),
            link: Mutex::new(Link {
                session,
                state: LinkState::Connected,
                hold_reconnect: false,
            }),
            events,
            latency,
        })
    }

    /// Reject every subsequent write with the given reason, or accept
    /// writes again with `None`.
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.lock().rejected_writes = reason.map(str::to_string);
    }

    /// Names of the children of `path`, sorted. Empty if `path` is absent.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children(path)
    }

    /// Whether a node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Payload stored at `path`.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|n| n.data.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connected,
    Disconnected,
    Closed,
}

struct Link {
    session: SessionId,
    state: LinkState,
    hold_reconnect: bool,
}

/// A client of an [`InMemoryEnsemble`].
pub struct MemoryClient {
    ensemble: InMemoryEnsemble,
    link: Mutex<Link>,
    events: broadcast::Sender<SessionEvent>,
    latency: Duration,
}

impl MemoryClient {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().expect("link lock")
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; state is always readable via session_state().
        let _ = self.events.send(event);
    }

    /// Current session id, whether or not it is connected.
    pub fn session_id(&self) -> SessionId {
        self.link().session
    }

    /// Drop the connection without expiring the session.
    pub fn disconnect(&self) {
        let mut link = self.link();
        if link.state != LinkState::Connected {
            return;
        }
        link.state = LinkState::Disconnected;
        drop(link);
        info!("in-memory client disconnected");
        self.publish(SessionEvent::Reconnecting);
    }

    /// Restore the connection. If the session expired while disconnected a
    /// new one is opened and `Expired` is published before `Connected`.
    pub fn reconnect(&self) {
        let mut link = self.link();
        if link.state != LinkState::Disconnected {
            return;
        }
        let mut events = Vec::new();
        {
            let mut ns = self.ensemble.lock();
            if !ns.live_sessions.contains(&link.session) {
                events.push(SessionEvent::Expired(link.session));
                link.session = ns.open_session();
            }
        }
        link.state = LinkState::Connected;
        events.push(SessionEvent::Connected(link.session));
        let session = link.session;
        drop(link);

        info!(%session, "in-memory client connected");
        for event in events {
            self.publish(event);
        }
    }

    /// Expire the current session. Unless reconnection is held, a new
    /// session is opened immediately afterwards.
    pub fn expire_session(&self) {
        let mut link = self.link();
        if link.state == LinkState::Closed {
            return;
        }
        let old = link.session;
        let removed = self.ensemble.lock().expire(old);
        info!(session = %old, removed, "in-memory session expired");

        let mut events = vec![SessionEvent::Expired(old)];
        if link.hold_reconnect {
            link.state = LinkState::Disconnected;
        } else {
            link.session = self.ensemble.lock().open_session();
            link.state = LinkState::Connected;
            events.push(SessionEvent::Connected(link.session));
        }
        drop(link);

        for event in events {
            self.publish(event);
        }
    }

    /// While held, an expired session leaves the client disconnected until
    /// [`MemoryClient::reconnect`] is called.
    pub fn hold_reconnect(&self, hold: bool) {
        self.link().hold_reconnect = hold;
    }

    /// Close the client, expiring its session.
    pub fn close(&self) {
        let mut link = self.link();
        if link.state == LinkState::Closed {
            return;
        }
        self.ensemble.lock().expire(link.session);
        link.state = LinkState::Closed;
        drop(link);
        info!("in-memory client closed");
        self.publish(SessionEvent::Closed);
    }

    async fn round_trip(&self) -> CoordResult<SessionId> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let link = self.link();
        match link.state {
            LinkState::Connected => Ok(link.session),
            LinkState::Disconnected => Err(CoordError::ConnectionLoss),
            LinkState::Closed => Err(CoordError::Closed),
        }
    }
}

#[async_trait]
impl Coordinator for MemoryClient {
    fn session_state(&self) -> SessionState {
        let link = self.link();
        match link.state {
            LinkState::Connected => SessionState::Connected(link.session),
            LinkState::Disconnected => SessionState::Disconnected,
            LinkState::Closed => SessionState::Closed,
        }
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn ensure_path(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        let session = self.round_trip().await?;
        let mut ns = self.ensemble.lock();
        ns.check_session(session)?;
        ns.ensure_path(path)
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix_path: &str,
        data: &[u8],
    ) -> CoordResult<CreatedNode> {
        validate_path(prefix_path)?;
        let session = self.round_trip().await?;
        let mut ns = self.ensemble.lock();
        ns.check_session(session)?;
        ns.check_writable()?;
        let path = ns.create_sequential(prefix_path, data.to_vec(), session)?;
        let name = node_name(&path).to_string();
        debug!(%path, %session, "ephemeral node created");
        Ok(CreatedNode {
            path,
            name,
            session,
        })
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        let session = self.round_trip().await?;
        let mut ns = self.ensemble.lock();
        ns.check_session(session)?;
        ns.check_writable()?;
        ns.delete(path)?;
        debug!(%path, "node deleted");
        Ok(())
    }

    async fn get_children_with_watch(
        &self,
        path: &str,
    ) -> CoordResult<(Vec<String>, ChildWatch)> {
        validate_path(path)?;
        let session = self.round_trip().await?;
        let mut ns = self.ensemble.lock();
        ns.check_session(session)?;
        if !ns.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let children = ns.children(path);
        let watch = ns.watch_children(path, session);
        Ok((children, watch))
    }

    async fn get_data(&self, path: &str) -> CoordResult<Vec<u8>> {
        validate_path(path)?;
        let session = self.round_trip().await?;
        let ns = self.ensemble.lock();
        ns.check_session(session)?;
        ns.nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }
}
