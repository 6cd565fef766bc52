//! serverset-group — the group membership protocol.
//!
//! A [`Group`] manages one logical membership path in a coordination
//! service. Processes join by creating an ephemeral sequential member
//! node carrying an opaque payload; watchers receive the ordered member
//! list every time it changes.
//!
//! # Architecture
//!
//! ```text
//! Group
//!   ├── join(payload)  → Membership   (ephemeral sequential node)
//!   ├── cancel(&Membership)            (idempotent delete)
//!   ├── watch(listener) → WatchHandle  (listing loop, one-shot watches)
//!   └── session loop
//!       ├── Reconnecting / Expired → GroupState::Reconnecting
//!       ├── Connected(new session) → re-create lost member nodes
//!       └── re-creation exhausted  → GroupState::Failed → Indeterminate
//! ```

pub mod config;
pub mod error;
pub mod group;
mod session;
pub mod state;
pub mod watch;

pub use config::{ConfigError, GroupConfig};
pub use error::{FailureCause, MembershipError, MembershipResult};
pub use group::{Group, MEMBER_PREFIX, Membership};
pub use state::GroupState;
pub use watch::{GroupEvent, GroupMember, WatchHandle};
