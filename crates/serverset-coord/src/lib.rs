//! serverset-coord — coordination service facade for service membership.
//!
//! Defines the small set of primitives the membership layer needs from a
//! hierarchical, watch-capable coordination service (ZooKeeper-style):
//! ephemeral sequential nodes, one-shot child watches, payload reads and
//! a session event stream.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (trait)
//!   ├── ensure_path / create_ephemeral_sequential / delete
//!   ├── get_children_with_watch → (names, ChildWatch)
//!   ├── get_data
//!   └── session_events → Connected | Reconnecting | Expired | Closed
//!
//! InMemoryEnsemble
//!   └── MemoryClient (one session each, fault injection for tests)
//! ```

pub mod client;
pub mod error;
pub mod memory;
pub mod path;
pub mod types;

pub use client::Coordinator;
pub use error::{CoordError, CoordResult};
pub use memory::{InMemoryEnsemble, MemoryClient};
pub use types::*;
