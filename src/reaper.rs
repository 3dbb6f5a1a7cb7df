use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::store::SpotWrite;

/// Release every booking left unconfirmed for longer than `grace`.
///
/// Each release deletes the Booking event and frees the spot in one
/// version-checked write. A booking that was confirmed or already released
/// by the time it is re-read is skipped, so running this twice in a row
/// reclaims nothing the second time. Returns the number reclaimed.
pub async fn reclaim_stale_bookings(engine: &Engine, now: Ms, grace: Ms) -> Result<usize, EngineError> {
    let stale = engine.store().booking_events_before(now.saturating_sub(grace)).await?;
    let mut reclaimed = 0;
    for booking in stale {
        let result = engine
            .maybe_commit_with_retry(booking.spot_id, |spot, events| {
                let still_booked = events
                    .iter()
                    .any(|e| e.id == booking.id && e.status == ReservationStatus::Booking);
                if !still_booked {
                    return Ok(None);
                }
                let mut next = spot;
                next.occupied = false;
                Ok(Some((SpotWrite::from_read(next).op(EventOp::Delete(booking.id)), ())))
            })
            .await;
        match result {
            Ok(Some(_)) => {
                reclaimed += 1;
                metrics::counter!(crate::observability::RECLAIMED_BOOKINGS_TOTAL).increment(1);
                warn!(
                    "reclaimed booking {} on spot {} by user {}, unconfirmed since {}",
                    booking.id, booking.spot_id, booking.user_id, booking.enter_time
                );
            }
            Ok(None) => debug!("booking {} no longer pending, skipping", booking.id),
            // Spot deleted between the scan and the write.
            Err(EngineError::NotFound(_)) => debug!("spot {} gone, skipping", booking.spot_id),
            Err(e) => return Err(e),
        }
    }
    Ok(reclaimed)
}
