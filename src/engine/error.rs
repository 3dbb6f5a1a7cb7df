use ulid::Ulid;

use crate::config::ConfigError;
use crate::model::{SpotId, UserId};
use crate::store::StoreError;

/// Coarse error class surfaced at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unauthorized,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidArgument(&'static str),
    NotFound(Ulid),
    /// Every spot is occupied.
    NoFreeSpot,
    /// The spot has no confirmed entry to exit from.
    NoOpenEntry(SpotId),
    /// The user id does not resolve.
    Unauthorized(UserId),
    /// A state-machine precondition does not hold.
    Occupation(&'static str),
    /// Compare-and-swap retries exhausted.
    Conflict(SpotId),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => ErrorKind::InvalidArgument,
            EngineError::NotFound(_) | EngineError::NoFreeSpot | EngineError::NoOpenEntry(_) => {
                ErrorKind::NotFound
            }
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::Occupation(_) | EngineError::Conflict(_) | EngineError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            EngineError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoFreeSpot => write!(f, "all parking spots are occupied"),
            EngineError::NoOpenEntry(id) => write!(f, "spot {id} has no confirmed entry"),
            EngineError::Unauthorized(id) => write!(f, "unknown user: {id}"),
            EngineError::Occupation(msg) => write!(f, "occupation conflict: {msg}"),
            EngineError::Conflict(id) => write!(f, "concurrent update on spot {id}, retries exhausted"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::OutOfRange(what) => EngineError::InvalidArgument(what),
            ConfigError::Invalid { var, .. } => EngineError::InvalidArgument(var),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::VersionConflict { spot, .. } => EngineError::Conflict(spot),
            other => EngineError::Store(other),
        }
    }
}
