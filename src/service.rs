use std::sync::Arc;

use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Caller-facing operations: ids and coordinates arrive as text, and "now"
/// is read from the injected clock.
#[derive(Clone)]
pub struct ParkingService {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

pub fn parse_id(raw: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw.trim()).map_err(|_| EngineError::InvalidArgument("malformed id"))
}

/// Decimal degrees, e.g. `"52.370216"`, `"4.895168"`.
pub fn parse_coordinates(latitude: &str, longitude: &str) -> Result<Coordinates, EngineError> {
    let lat = Microdegrees::parse(latitude).ok_or(EngineError::InvalidArgument("malformed latitude"))?;
    let lon = Microdegrees::parse(longitude).ok_or(EngineError::InvalidArgument("malformed longitude"))?;
    let coordinates = Coordinates::new(lat, lon);
    if !coordinates.is_valid() {
        return Err(EngineError::InvalidArgument("coordinates out of range"));
    }
    Ok(coordinates)
}

impl ParkingService {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn suggest(&self, latitude: &str, longitude: &str, user_id: &str) -> Result<SpotInfo, EngineError> {
        let at = parse_coordinates(latitude, longitude)?;
        let user = parse_id(user_id)?;
        self.engine.suggest_spot(at, user, self.clock.now()).await
    }

    pub async fn check_favourite(&self, user_id: &str, spot_id: &str) -> Result<SpotInfo, EngineError> {
        let (user, spot) = (parse_id(user_id)?, parse_id(spot_id)?);
        self.engine.check_favourite(user, spot, self.clock.now()).await
    }

    pub async fn confirm_entry(&self, user_id: &str, spot_id: &str) -> Result<(), EngineError> {
        let (user, spot) = (parse_id(user_id)?, parse_id(spot_id)?);
        self.engine.confirm_entry(user, spot, self.clock.now()).await
    }

    pub async fn confirm_exit(&self, user_id: &str, spot_id: &str) -> Result<(), EngineError> {
        let (user, spot) = (parse_id(user_id)?, parse_id(spot_id)?);
        self.engine.confirm_exit(user, spot, self.clock.now()).await
    }

    pub async fn report_blocking(&self, user_id: &str, spot_id: &str) -> Result<(), EngineError> {
        let (user, spot) = (parse_id(user_id)?, parse_id(spot_id)?);
        self.engine.report_blocking(user, spot, self.clock.now()).await
    }

    pub async fn clear_blocking(&self, user_id: &str, spot_id: &str) -> Result<(), EngineError> {
        let (user, spot) = (parse_id(user_id)?, parse_id(spot_id)?);
        self.engine.clear_blocking(user, spot, self.clock.now()).await
    }

    pub async fn add_spot(&self, latitude: &str, longitude: &str) -> Result<SpotInfo, EngineError> {
        self.engine.add_spot(parse_coordinates(latitude, longitude)?).await
    }

    pub async fn delete_spot(&self, spot_id: &str) -> Result<(), EngineError> {
        self.engine.delete_spot(parse_id(spot_id)?).await
    }

    pub async fn list_spots(&self) -> Result<Vec<SpotInfo>, EngineError> {
        self.engine.list_spots().await
    }

    pub async fn add_user(&self, name: &str) -> Result<User, EngineError> {
        self.engine.add_user(name).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>, EngineError> {
        self.engine.list_users().await
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<(), EngineError> {
        self.engine.delete_user(parse_id(user_id)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::config::EngineConfig;
    use crate::engine::ErrorKind;
    use crate::store::WalStore;
    use std::path::PathBuf;

    const T0: Ms = 1_700_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotwise_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> (ParkingService, Arc<SimulatedClock>) {
        let store = WalStore::open(test_wal_path(name)).unwrap();
        let engine = Arc::new(Engine::new(Arc::new(store), EngineConfig::default()));
        let clock = Arc::new(SimulatedClock::new(T0));
        (ParkingService::new(engine, clock.clone()), clock)
    }

    #[test]
    fn coordinates_parse_exactly() {
        let c = parse_coordinates("10.000100", "-20.5").unwrap();
        assert_eq!(c.latitude.raw(), 10_000_100);
        assert_eq!(c.longitude.raw(), -20_500_000);
        assert!(parse_coordinates("91", "0").is_err());
        assert!(parse_coordinates("10.1234567", "0").is_err());
        assert!(parse_coordinates("north", "0").is_err());
    }

    #[test]
    fn malformed_ids_are_invalid_arguments() {
        assert_eq!(parse_id("not-a-ulid").unwrap_err().kind(), ErrorKind::InvalidArgument);
        let id = Ulid::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[tokio::test]
    async fn lifecycle_uses_the_injected_clock() {
        let (svc, clock) = service("svc_lifecycle.wal");
        let spot = svc.add_spot("10", "20").await.unwrap();
        let user = svc.add_user("ada").await.unwrap();
        let uid = user.id.to_string();
        let sid = spot.id.to_string();

        let got = svc.suggest("10.0001", "20.0001", &uid).await.unwrap();
        assert_eq!(got.id, spot.id);

        clock.advance(5 * MINUTE);
        svc.confirm_entry(&uid, &sid).await.unwrap();
        let log = svc.engine().events_for(spot.id).await.unwrap();
        assert_eq!(log[0].enter_time, T0 + 5 * MINUTE);

        clock.advance(HOUR);
        svc.confirm_exit(&uid, &sid).await.unwrap();
        let log = svc.engine().events_for(spot.id).await.unwrap();
        assert_eq!(log[0].leave_time, Some(T0 + 5 * MINUTE + HOUR));

        let listed = svc.list_spots().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].occupied);
    }

    #[tokio::test]
    async fn bad_input_never_reaches_the_engine() {
        let (svc, _) = service("svc_bad_input.wal");
        assert_eq!(
            svc.confirm_entry("garbage", &Ulid::new().to_string()).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            svc.suggest("10", "200", &Ulid::new().to_string()).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            svc.delete_user("").await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        // Well-formed but unknown user.
        assert_eq!(
            svc.suggest("10", "20", &Ulid::new().to_string()).await.unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[tokio::test]
    async fn blocking_round_trip() {
        let (svc, clock) = service("svc_blocking.wal");
        let spot = svc.add_spot("1.5", "2.5").await.unwrap();
        let uid = svc.add_user("ada").await.unwrap().id.to_string();
        let sid = spot.id.to_string();

        svc.report_blocking(&uid, &sid).await.unwrap();
        assert_eq!(svc.check_favourite(&uid, &sid).await.unwrap_err().kind(), ErrorKind::Conflict);
        clock.advance(MINUTE);
        svc.clear_blocking(&uid, &sid).await.unwrap();
        assert!(svc.check_favourite(&uid, &sid).await.unwrap().occupied);
        assert_eq!(svc.delete_spot(&sid).await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(svc.list_users().await.unwrap().len(), 1);
    }
}
