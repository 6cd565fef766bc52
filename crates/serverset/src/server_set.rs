//! ServerSet — service endpoint registration on top of a [`Group`].
//!
//! `join` encodes a [`ServiceInstance`] into a member payload and registers
//! it; the returned [`EndpointStatus`] withdraws it again. Every group
//! listing is decoded into a [`HostSnapshot`] and handed to the
//! [`HostSetDispatcher`], which notifies monitors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serverset_coord::Coordinator;
use serverset_group::{
    FailureCause, Group, GroupEvent, GroupMember, MembershipError, MembershipResult, Membership,
    WatchHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{InstanceCodec, JsonCodec};
use crate::config::ServerSetConfig;
use crate::error::ServerSetResult;
use crate::host_set::{DynamicHostSet, HostChangeMonitor, HostSetDispatcher, MonitorHandle};
use crate::instance::ServiceInstance;
use crate::snapshot::HostSnapshot;

/// A dynamic set of service instances that processes can join.
#[async_trait]
pub trait ServerSet: DynamicHostSet<ServiceInstance> {
    /// Advertise `endpoint` (and named auxiliary endpoints) as alive.
    async fn join(
        &self,
        endpoint: SocketAddr,
        additional: HashMap<String, SocketAddr>,
    ) -> MembershipResult<EndpointStatus> {
        self.join_interruptible(endpoint, additional, None, &CancellationToken::new())
            .await
    }

    /// Like [`ServerSet::join`], tagging the record with a shard id. Shard
    /// ids are advisory; duplicates are accepted.
    async fn join_with_shard(
        &self,
        endpoint: SocketAddr,
        additional: HashMap<String, SocketAddr>,
        shard: u32,
    ) -> MembershipResult<EndpointStatus> {
        self.join_interruptible(endpoint, additional, Some(shard), &CancellationToken::new())
            .await
    }

    /// Join, giving up with [`MembershipError::Interrupted`] once
    /// `interrupt` is cancelled.
    async fn join_interruptible(
        &self,
        endpoint: SocketAddr,
        additional: HashMap<String, SocketAddr>,
        shard: Option<u32>,
        interrupt: &CancellationToken,
    ) -> MembershipResult<EndpointStatus>;
}

/// Proof of a successful join. Owned by the joining caller.
pub struct EndpointStatus {
    membership: Membership,
    instance: ServiceInstance,
}

impl fmt::Debug for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointStatus")
            .field("group", &self.membership.group().path())
            .field("endpoint", &self.instance.service_endpoint)
            .field("shard", &self.instance.shard)
            .finish()
    }
}

impl EndpointStatus {
    /// Withdraw the registration. Calling it again after success, or after
    /// the node already vanished, also succeeds.
    pub async fn leave(&self) -> MembershipResult<()> {
        self.membership.cancel().await?;
        info!(
            group = %self.membership.group().path(),
            endpoint = %self.instance.service_endpoint,
            "endpoint left server set"
        );
        Ok(())
    }

    /// Current member node name; changes when the node is re-created under
    /// a new session.
    pub async fn member_id(&self) -> Option<String> {
        self.membership.member_id().await
    }

    /// The record that was advertised.
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }
}

/// A [`ServerSet`] backed by a coordination-service group.
pub struct GroupServerSet {
    group: Group,
    codec: Arc<dyn InstanceCodec>,
    dispatcher: Arc<HostSetDispatcher<ServiceInstance>>,
    _watch: WatchHandle,
    dispatch: JoinHandle<()>,
}

impl fmt::Debug for GroupServerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupServerSet")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl GroupServerSet {
    /// Create a server set using JSON member records. Must be called
    /// inside a Tokio runtime.
    pub fn new(client: Arc<dyn Coordinator>, config: ServerSetConfig) -> ServerSetResult<Self> {
        Self::with_codec(client, config, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        client: Arc<dyn Coordinator>,
        config: ServerSetConfig,
        codec: Arc<dyn InstanceCodec>,
    ) -> ServerSetResult<Self> {
        config.validate()?;
        let group = Group::new(client, config.path.clone(), config.group.clone())?;
        let dispatcher = Arc::new(HostSetDispatcher::new(
            config.path.clone(),
            config.dispatch_config(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let watch = group.watch(tx);
        let dispatch = tokio::spawn(run_dispatch(
            config.path.clone(),
            rx,
            codec.clone(),
            dispatcher.clone(),
        ));

        info!(group = %config.path, "server set created");
        Ok(Self {
            group,
            codec,
            dispatcher,
            _watch: watch,
            dispatch,
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The last published host set, if membership is currently known.
    pub fn current(&self) -> Option<HostSnapshot<ServiceInstance>> {
        self.dispatcher.current()
    }
}

impl Drop for GroupServerSet {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

#[async_trait]
impl DynamicHostSet<ServiceInstance> for GroupServerSet {
    async fn monitor(&self, monitor: Arc<dyn HostChangeMonitor<ServiceInstance>>) -> MonitorHandle {
        self.dispatcher.monitor(monitor).await
    }
}

#[async_trait]
impl ServerSet for GroupServerSet {
    async fn join_interruptible(
        &self,
        endpoint: SocketAddr,
        additional: HashMap<String, SocketAddr>,
        shard: Option<u32>,
        interrupt: &CancellationToken,
    ) -> MembershipResult<EndpointStatus> {
        let instance = ServiceInstance::from_addrs(endpoint, &additional, shard);
        let payload = self.codec.encode(&instance).map_err(|e| {
            MembershipError::join(self.group.path(), FailureCause::Encode(e.to_string()))
        })?;

        let membership = self.group.join(payload, interrupt).await?;
        info!(
            group = %self.group.path(),
            endpoint = %instance.service_endpoint,
            shard = ?instance.shard,
            "endpoint joined server set"
        );
        Ok(EndpointStatus {
            membership,
            instance,
        })
    }
}

/// Decoded records by member node id. `None` marks a payload that failed
/// to decode and has already been reported.
type DecodeCache = HashMap<String, Option<ServiceInstance>>;

async fn run_dispatch(
    path: String,
    mut events: mpsc::UnboundedReceiver<GroupEvent>,
    codec: Arc<dyn InstanceCodec>,
    dispatcher: Arc<HostSetDispatcher<ServiceInstance>>,
) {
    let mut cache = DecodeCache::new();
    while let Some(event) = events.recv().await {
        match event {
            GroupEvent::Members(members) => {
                let snapshot = decode_members(&path, codec.as_ref(), &members, &mut cache);
                dispatcher.publish(snapshot).await;
            }
            GroupEvent::Indeterminate => dispatcher.publish_indeterminate().await,
        }
    }
    debug!(group = %path, "server set dispatch stopped");
}

/// Decode a listing into a snapshot, dropping members whose payload does
/// not decode. Member payloads never change, so decodes are cached per
/// node id.
fn decode_members(
    path: &str,
    codec: &dyn InstanceCodec,
    members: &[GroupMember],
    cache: &mut DecodeCache,
) -> HostSnapshot<ServiceInstance> {
    let present: HashSet<&str> = members.iter().map(|m| m.id.as_str()).collect();
    cache.retain(|id, _| present.contains(id.as_str()));

    let mut hosts = Vec::with_capacity(members.len());
    for member in members {
        let decoded = cache
            .entry(member.id.clone())
            .or_insert_with(|| match codec.decode(&member.data) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    warn!(group = %path, member = %member.id, error = %e, "dropping member with undecodable payload");
                    None
                }
            });
        if let Some(instance) = decoded {
            hosts.push(instance.clone());
        }
    }
    HostSnapshot::new(hosts)
}
