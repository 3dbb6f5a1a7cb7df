use tracing::{debug, error, info};

use crate::limits::MAX_ALLOCATION_ATTEMPTS;
use crate::model::*;
use crate::store::{SpotWrite, StoreError};

use super::{open_event, record_outcome, Engine, EngineError};

/// Pick the free spot with the lowest `occupation_ratio × distance`.
///
/// A nearby spot that is usually taken loses to a farther one that is
/// reliably free. Ties go to the shorter distance, then to the lower id.
pub fn select_spot<'a>(spots: &'a [Spot], at: &Coordinates) -> Option<&'a Spot> {
    spots
        .iter()
        .filter(|s| !s.occupied)
        .map(|s| {
            let distance = at.distance_to(&s.coordinates);
            (s.occupation_ratio * distance, distance, s)
        })
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.id.cmp(&b.2.id))
        })
        .map(|(_, _, s)| s)
}

/// Soft hold: mark the spot occupied and open a Booking event.
fn booking_write(spot: &Spot, user_id: UserId, now: Ms) -> SpotWrite {
    let mut next = spot.clone();
    next.occupied = true;
    SpotWrite::from_read(next).op(EventOp::Append(ReservationEvent::open(
        spot.id,
        user_id,
        ReservationStatus::Booking,
        now,
    )))
}

impl Engine {
    /// Book the best free spot for a user standing at `at`.
    pub async fn suggest_spot(&self, at: Coordinates, user_id: UserId, now: Ms) -> Result<SpotInfo, EngineError> {
        let result = self.suggest_inner(at, user_id, now).await;
        record_outcome("suggest", &result);
        result
    }

    async fn suggest_inner(&self, at: Coordinates, user_id: UserId, now: Ms) -> Result<SpotInfo, EngineError> {
        if !at.is_valid() {
            return Err(EngineError::InvalidArgument("coordinates out of range"));
        }
        self.require_user(user_id).await?;

        // Each round re-reads the spot list, so a spot lost to a concurrent
        // caller drops out and the next best candidate is tried.
        let mut last_contended = None;
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let spots = self.store.list_spots().await?;
            let Some(best) = select_spot(&spots, &at) else {
                return Err(EngineError::NoFreeSpot);
            };
            match self.store.upsert_spot(booking_write(best, user_id, now)).await {
                Ok(stored) => {
                    info!("booked spot {} for user {user_id}", stored.id);
                    return Ok(SpotInfo::from(&stored));
                }
                Err(StoreError::VersionConflict { spot, .. }) | Err(StoreError::NotFound(spot)) => {
                    metrics::counter!(crate::observability::ALLOCATION_RETRIES_TOTAL).increment(1);
                    debug!("lost the race for spot {spot}, retrying");
                    last_contended = Some(spot);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_contended.map_or(EngineError::NoFreeSpot, EngineError::Conflict))
    }

    /// Book a spot the user picked by id.
    pub async fn check_favourite(&self, user_id: UserId, spot_id: SpotId, now: Ms) -> Result<SpotInfo, EngineError> {
        let result: Result<SpotInfo, EngineError> = async {
            self.require_user(user_id).await?;
            let (stored, ()) = self
                .commit_with_retry(spot_id, |spot, _| {
                    if spot.occupied {
                        return Err(EngineError::Occupation("requested spot is currently occupied"));
                    }
                    Ok((booking_write(&spot, user_id, now), ()))
                })
                .await?;
            info!("booked favourite spot {spot_id} for user {user_id}");
            Ok(SpotInfo::from(&stored))
        }
        .await;
        record_outcome("favourite", &result);
        result
    }

    /// The user arrived at a spot they booked.
    pub async fn confirm_entry(&self, user_id: UserId, spot_id: SpotId, now: Ms) -> Result<(), EngineError> {
        let result: Result<(), EngineError> = async {
            self.require_user(user_id).await?;
            self.commit_with_retry(spot_id, |spot, events| {
                if !spot.occupied {
                    return Err(EngineError::Occupation("spot is not booked"));
                }
                let booking = match open_event(events) {
                    Some(ev) if ev.status == ReservationStatus::Booking && ev.user_id == user_id => ev,
                    _ => return Err(EngineError::Occupation("spot is not booked by this user")),
                };
                let mut entered = booking.clone();
                entered.status = ReservationStatus::Entering;
                entered.enter_time = now;
                entered.opened_at = now;
                Ok((SpotWrite::from_read(spot).op(EventOp::Update(entered)), ()))
            })
            .await?;
            info!("user {user_id} entered spot {spot_id}");
            Ok(())
        }
        .await;
        record_outcome("enter", &result);
        result
    }

    /// The user left a spot. Honoured even when someone else entered it: a
    /// spot must never stay occupied because of bookkeeping on the client.
    pub async fn confirm_exit(&self, user_id: UserId, spot_id: SpotId, now: Ms) -> Result<(), EngineError> {
        let result: Result<(), EngineError> = async {
            self.require_user(user_id).await?;
            let (_, entered_by) = self
                .commit_with_retry(spot_id, |spot, events| {
                    if !spot.occupied {
                        return Err(EngineError::Occupation("spot is not occupied"));
                    }
                    let entry = match open_event(events) {
                        Some(ev) if ev.status == ReservationStatus::Entering => ev,
                        _ => return Err(EngineError::NoOpenEntry(spot_id)),
                    };
                    let mut left = entry.clone();
                    left.status = ReservationStatus::Leaving;
                    left.leave_time = Some(now);
                    let mut next = spot;
                    next.occupied = false;
                    Ok((SpotWrite::from_read(next).op(EventOp::Update(left)), entry.user_id))
                })
                .await?;
            if entered_by != user_id {
                metrics::counter!(crate::observability::EXIT_OWNER_MISMATCH_TOTAL).increment(1);
                error!(
                    "user misallocation on spot {spot_id}: entered by {entered_by}, left by {user_id}"
                );
            }
            info!("user {user_id} left spot {spot_id}");
            Ok(())
        }
        .await;
        record_outcome("exit", &result);
        result
    }

    /// Mark a free spot as unavailable (e.g. obstructed) for the configured
    /// block duration.
    pub async fn report_blocking(&self, user_id: UserId, spot_id: SpotId, now: Ms) -> Result<(), EngineError> {
        let block_duration = self.config.block_duration;
        let result: Result<(), EngineError> = async {
            self.require_user(user_id).await?;
            self.commit_with_retry(spot_id, |spot, _| {
                if spot.occupied {
                    return Err(EngineError::Occupation("spot is already occupied"));
                }
                let mut block = ReservationEvent::open(spot.id, user_id, ReservationStatus::Unavailable, now);
                block.leave_time = Some(now + block_duration);
                let mut next = spot;
                next.occupied = true;
                Ok((SpotWrite::from_read(next).op(EventOp::Append(block)), ()))
            })
            .await?;
            info!("user {user_id} reported spot {spot_id} blocked");
            Ok(())
        }
        .await;
        record_outcome("block", &result);
        result
    }

    /// Lift a manual block before it expires.
    pub async fn clear_blocking(&self, user_id: UserId, spot_id: SpotId, now: Ms) -> Result<(), EngineError> {
        let result: Result<(), EngineError> = async {
            self.require_user(user_id).await?;
            self.commit_with_retry(spot_id, |spot, events| {
                let block = match open_event(events) {
                    Some(ev) if ev.status == ReservationStatus::Unavailable => ev,
                    _ => return Err(EngineError::Occupation("spot is not blocked")),
                };
                let mut cleared = block.clone();
                cleared.status = ReservationStatus::Leaving;
                cleared.leave_time = Some(now.max(block.enter_time));
                let mut next = spot;
                next.occupied = false;
                Ok((SpotWrite::from_read(next).op(EventOp::Update(cleared)), ()))
            })
            .await?;
            info!("user {user_id} cleared the block on spot {spot_id}");
            Ok(())
        }
        .await;
        record_outcome("unblock", &result);
        result
    }
}
