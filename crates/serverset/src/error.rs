use serverset_coord::CoordError;
use serverset_group::ConfigError;
use thiserror::Error;

/// Errors constructing a server set. Join and leave failures are
/// [`serverset_group::MembershipError`]s.
#[derive(Debug, Error)]
pub enum ServerSetError {
    #[error("invalid server set configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordination(#[from] CoordError),
}

pub type ServerSetResult<T> = Result<T, ServerSetError>;
