use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_ALLOCATION_ATTEMPTS, MAX_SPOTS, MAX_USER_NAME_LEN, MAX_USERS};
use crate::model::*;
use crate::store::StoreError;

use super::{open_event, Engine, EngineError};

impl Engine {
    pub async fn add_spot(&self, coordinates: Coordinates) -> Result<SpotInfo, EngineError> {
        if !coordinates.is_valid() {
            return Err(EngineError::InvalidArgument("coordinates out of range"));
        }
        if self.store.list_spots().await?.len() >= MAX_SPOTS {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        let spot = Spot::new(Ulid::new(), coordinates);
        self.store.insert_spot(spot.clone()).await?;
        info!("added spot {} at {coordinates}", spot.id);
        Ok(SpotInfo::from(&spot))
    }

    /// Remove a spot together with its closed log entries and samples.
    /// Refused while the spot has an open reservation.
    pub async fn delete_spot(&self, id: SpotId) -> Result<(), EngineError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let spot = self.require_spot(id).await?;
            let events = self.store.events_for(id).await?;
            if spot.occupied || open_event(&events).is_some() {
                return Err(EngineError::Occupation("spot has an open reservation"));
            }
            match self.store.remove_spot(id, spot.version).await {
                Ok(()) => {
                    info!("deleted spot {id}");
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(id))
    }

    pub async fn get_spot(&self, id: SpotId) -> Result<SpotInfo, EngineError> {
        Ok(SpotInfo::from(&self.require_spot(id).await?))
    }

    pub async fn list_spots(&self) -> Result<Vec<SpotInfo>, EngineError> {
        Ok(self.store.list_spots().await?.iter().map(SpotInfo::from).collect())
    }

    pub async fn add_user(&self, name: &str) -> Result<User, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("user name must not be empty"));
        }
        if name.len() > MAX_USER_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.store.list_users().await?.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let user = User {
            id: Ulid::new(),
            name: name.to_string(),
        };
        self.store.insert_user(user.clone()).await?;
        info!("added user {}", user.id);
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, EngineError> {
        Ok(self.store.list_users().await?)
    }

    /// Refused while the user holds an open reservation anywhere.
    pub async fn delete_user(&self, id: UserId) -> Result<(), EngineError> {
        if self.store.find_user(id).await?.is_none() {
            return Err(EngineError::NotFound(id));
        }
        for spot in self.store.list_spots().await? {
            let events = match self.store.events_for(spot.id).await {
                Ok(events) => events,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if open_event(&events).is_some_and(|e| e.user_id == id) {
                return Err(EngineError::Occupation("user holds an open reservation"));
            }
        }
        self.store.remove_user(id).await?;
        info!("deleted user {id}");
        Ok(())
    }
}
