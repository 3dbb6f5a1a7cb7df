use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::model::*;

use super::{SpotStore, SpotWrite, StoreError, WalStore};

/// `WalStore` wrapper that injects failures and interleaved writes.
pub(crate) struct FaultyStore {
    pub inner: WalStore,
    /// `list_spots` fails this many more times.
    pub list_failures: AtomicUsize,
    /// The next `append_sample` for this spot fails.
    pub fail_sample_for: Mutex<Option<SpotId>>,
    /// Before the next write to this spot lands, another user books it.
    pub book_before_write: Mutex<Option<(SpotId, UserId, Ms)>>,
}

impl FaultyStore {
    pub fn new(inner: WalStore) -> Self {
        Self {
            inner,
            list_failures: AtomicUsize::new(0),
            fail_sample_for: Mutex::new(None),
            book_before_write: Mutex::new(None),
        }
    }

    fn injected() -> StoreError {
        StoreError::Unavailable("injected failure".into())
    }

    async fn book_directly(&self, spot_id: SpotId, user_id: UserId, at: Ms) -> Result<(), StoreError> {
        let mut spot = self.inner.get_spot(spot_id).await?.ok_or(StoreError::NotFound(spot_id))?;
        spot.occupied = true;
        let booking = ReservationEvent::open(spot_id, user_id, ReservationStatus::Booking, at);
        self.inner
            .upsert_spot(SpotWrite::from_read(spot).op(EventOp::Append(booking)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SpotStore for FaultyStore {
    async fn get_spot(&self, id: SpotId) -> Result<Option<Spot>, StoreError> {
        self.inner.get_spot(id).await
    }
    async fn list_spots(&self) -> Result<Vec<Spot>, StoreError> {
        let left = self.list_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.list_failures.store(left - 1, Ordering::SeqCst);
            return Err(Self::injected());
        }
        self.inner.list_spots().await
    }
    async fn insert_spot(&self, spot: Spot) -> Result<(), StoreError> {
        self.inner.insert_spot(spot).await
    }
    async fn remove_spot(&self, id: SpotId, expected_version: u64) -> Result<(), StoreError> {
        self.inner.remove_spot(id, expected_version).await
    }
    async fn upsert_spot(&self, write: SpotWrite) -> Result<Spot, StoreError> {
        let armed = {
            let mut slot = self.book_before_write.lock().unwrap();
            match *slot {
                Some((spot_id, _, _)) if spot_id == write.spot.id => slot.take(),
                _ => None,
            }
        };
        if let Some((spot_id, user_id, at)) = armed {
            self.book_directly(spot_id, user_id, at).await?;
        }
        self.inner.upsert_spot(write).await
    }
    async fn events_for(&self, spot: SpotId) -> Result<Vec<ReservationEvent>, StoreError> {
        self.inner.events_for(spot).await
    }
    async fn booking_events_before(&self, cutoff: Ms) -> Result<Vec<ReservationEvent>, StoreError> {
        self.inner.booking_events_before(cutoff).await
    }
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.inner.find_user(id).await
    }
    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.inner.list_users().await
    }
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.inner.insert_user(user).await
    }
    async fn remove_user(&self, id: UserId) -> Result<(), StoreError> {
        self.inner.remove_user(id).await
    }
    async fn append_sample(&self, sample: DurationSample) -> Result<(), StoreError> {
        let fail = {
            let mut slot = self.fail_sample_for.lock().unwrap();
            if *slot == Some(sample.spot_id) {
                slot.take().is_some()
            } else {
                false
            }
        };
        if fail {
            return Err(Self::injected());
        }
        self.inner.append_sample(sample).await
    }
    async fn recent_samples(&self, spot: SpotId, limit: usize) -> Result<Vec<DurationSample>, StoreError> {
        self.inner.recent_samples(spot, limit).await
    }
    async fn load_scheduler_state(&self) -> Result<SchedulerState, StoreError> {
        self.inner.load_scheduler_state().await
    }
    async fn save_scheduler_state(&self, state: SchedulerState) -> Result<(), StoreError> {
        self.inner.save_scheduler_state(state).await
    }
}
