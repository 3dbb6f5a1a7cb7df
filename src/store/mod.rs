mod wal_store;
#[cfg(test)]
pub(crate) mod testing;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The spot changed since it was read.
    VersionConflict {
        spot: SpotId,
        expected: u64,
        actual: u64,
    },
    /// A log operation referenced an event the spot does not have.
    UnknownEvent(EventId),
    WalError(String),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::VersionConflict {
                spot,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on spot {spot}: expected {expected}, found {actual}"
            ),
            StoreError::UnknownEvent(id) => write!(f, "unknown reservation event: {id}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// One atomic write to a spot: the new row plus the log operations that go
/// with it. Rejected with `VersionConflict` unless the stored version still
/// equals `expected_version`.
#[derive(Debug, Clone)]
pub struct SpotWrite {
    pub spot: Spot,
    pub expected_version: u64,
    pub ops: Vec<EventOp>,
}

impl SpotWrite {
    /// Write `spot` back, expecting it unchanged since it was read.
    pub fn from_read(spot: Spot) -> Self {
        let expected_version = spot.version;
        Self {
            spot,
            expected_version,
            ops: Vec::new(),
        }
    }

    pub fn op(mut self, op: EventOp) -> Self {
        self.ops.push(op);
        self
    }
}

/// Durable collection of spots, their reservation logs, duration samples,
/// users and the scheduler checkpoint.
#[async_trait]
pub trait SpotStore: Send + Sync {
    async fn get_spot(&self, id: SpotId) -> Result<Option<Spot>, StoreError>;

    async fn list_spots(&self) -> Result<Vec<Spot>, StoreError>;

    async fn insert_spot(&self, spot: Spot) -> Result<(), StoreError>;

    /// Remove a spot with its log and samples.
    async fn remove_spot(&self, id: SpotId, expected_version: u64) -> Result<(), StoreError>;

    /// Compare-and-swap write of a spot and its log. Returns the stored spot
    /// with its new version.
    async fn upsert_spot(&self, write: SpotWrite) -> Result<Spot, StoreError>;

    /// The spot's log: open events plus closed ones not yet folded, oldest first.
    async fn events_for(&self, spot: SpotId) -> Result<Vec<ReservationEvent>, StoreError>;

    /// Open Booking events with `enter_time < cutoff`, across all spots.
    async fn booking_events_before(&self, cutoff: Ms) -> Result<Vec<ReservationEvent>, StoreError>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    async fn insert_user(&self, user: User) -> Result<(), StoreError>;

    async fn remove_user(&self, id: UserId) -> Result<(), StoreError>;

    async fn append_sample(&self, sample: DurationSample) -> Result<(), StoreError>;

    /// Up to `limit` samples for a spot, newest first.
    async fn recent_samples(&self, spot: SpotId, limit: usize) -> Result<Vec<DurationSample>, StoreError>;

    async fn load_scheduler_state(&self) -> Result<SchedulerState, StoreError>;

    async fn save_scheduler_state(&self, state: SchedulerState) -> Result<(), StoreError>;
}
