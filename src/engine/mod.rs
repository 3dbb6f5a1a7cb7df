mod allocation;
mod error;
mod spots;

pub use allocation::select_spot;
pub use error::{EngineError, ErrorKind};

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::limits::MAX_ALLOCATION_ATTEMPTS;
use crate::model::*;
use crate::store::{SpotStore, SpotWrite, StoreError};

/// Spot allocation and the per-spot reservation state machine.
///
/// The engine keeps no state of its own; every decision is a read of the
/// store followed by a version-checked write, so any number of engines may
/// share one store.
pub struct Engine {
    store: Arc<dyn SpotStore>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn SpotStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn SpotStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) async fn require_user(&self, id: UserId) -> Result<User, EngineError> {
        self.store
            .find_user(id)
            .await?
            .ok_or(EngineError::Unauthorized(id))
    }

    pub(crate) async fn require_spot(&self, id: SpotId) -> Result<Spot, EngineError> {
        self.store.get_spot(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Read the spot and its log, let `plan` decide the write, commit it with
    /// a version check. A concurrent writer forces a fresh read; after
    /// `MAX_ALLOCATION_ATTEMPTS` lost races the call fails with `Conflict`.
    pub(crate) async fn commit_with_retry<T, F>(&self, spot_id: SpotId, mut plan: F) -> Result<(Spot, T), EngineError>
    where
        F: FnMut(Spot, &[ReservationEvent]) -> Result<(SpotWrite, T), EngineError>,
    {
        self.maybe_commit_with_retry(spot_id, |spot, events| plan(spot, events).map(Some))
            .await?
            .ok_or(EngineError::Conflict(spot_id))
    }

    /// Like `commit_with_retry`, but `plan` may decline to write by
    /// returning `None`, which ends the loop with `Ok(None)`.
    pub(crate) async fn maybe_commit_with_retry<T, F>(
        &self,
        spot_id: SpotId,
        mut plan: F,
    ) -> Result<Option<(Spot, T)>, EngineError>
    where
        F: FnMut(Spot, &[ReservationEvent]) -> Result<Option<(SpotWrite, T)>, EngineError>,
    {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let spot = self.require_spot(spot_id).await?;
            let events = self.store.events_for(spot_id).await?;
            let Some((write, out)) = plan(spot, &events)? else {
                return Ok(None);
            };
            match self.store.upsert_spot(write).await {
                Ok(stored) => return Ok(Some((stored, out))),
                Err(StoreError::VersionConflict { .. }) => {
                    metrics::counter!(crate::observability::ALLOCATION_RETRIES_TOTAL).increment(1);
                    tracing::debug!("spot {spot_id} changed underneath us (attempt {attempt})");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(spot_id))
    }

    /// The spot's unfolded log, oldest first.
    pub async fn events_for(&self, spot_id: SpotId) -> Result<Vec<ReservationEvent>, EngineError> {
        Ok(self.store.events_for(spot_id).await?)
    }
}

/// The single open event of a spot, if any.
pub(crate) fn open_event(events: &[ReservationEvent]) -> Option<&ReservationEvent> {
    events.iter().rev().find(|e| e.is_open())
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(
        crate::observability::ALLOCATIONS_TOTAL,
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}
