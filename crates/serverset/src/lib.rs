//! serverset — service endpoint registration and discovery.
//!
//! Servers [`join`](ServerSet::join) a server set by advertising a
//! [`ServiceInstance`] under a group path; clients
//! [`monitor`](DynamicHostSet::monitor) the set and receive the complete
//! list of live instances every time it changes.
//!
//! # Architecture
//!
//! ```text
//! GroupServerSet
//!   ├── join(endpoint, additional[, shard]) → EndpointStatus
//!   │     └── JsonCodec::encode → Group::join (ephemeral sequential node)
//!   ├── EndpointStatus::leave → Group::cancel (idempotent)
//!   └── Group::watch → dispatch task
//!         ├── decode payloads (cached per node, failures dropped)
//!         └── HostSetDispatcher → monitors, in registration order
//! ```
//!
//! The coordination service is reached through
//! [`serverset_coord::Coordinator`]; tests and local development use
//! [`serverset_coord::InMemoryEnsemble`].

pub mod codec;
pub mod config;
pub mod error;
pub mod host_set;
pub mod instance;
pub mod server_set;
pub mod snapshot;

pub use codec::{CodecError, InstanceCodec, JsonCodec};
pub use config::ServerSetConfig;
pub use error::{ServerSetError, ServerSetResult};
pub use host_set::{
    ChannelMonitor, DispatchConfig, DynamicHostSet, FnMonitor, HostChangeMonitor,
    HostSetDispatcher, HostUpdate, MonitorHandle,
};
pub use instance::{Endpoint, ServiceInstance, Status};
pub use server_set::{EndpointStatus, GroupServerSet, ServerSet};
pub use snapshot::HostSnapshot;

pub use serverset_group::{MembershipError, MembershipResult};
