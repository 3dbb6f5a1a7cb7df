use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Durations are plain `Ms` spans too.
pub type Ms = i64;

pub const SECOND: Ms = 1_000;
pub const MINUTE: Ms = 60 * SECOND;
pub const HOUR: Ms = 60 * MINUTE;

pub type SpotId = Ulid;
pub type UserId = Ulid;
pub type EventId = Ulid;

/// Occupation ratio assigned to spots without any history.
pub const PRIOR_RATIO: f64 = 0.5;

const MICROS_PER_DEGREE: i64 = 1_000_000;

/// Fixed-point angle with six fractional digits. Stored as an integer so that
/// repeated persistence round-trips never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Microdegrees(i64);

impl Microdegrees {
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Rounds to the nearest microdegree.
    pub fn from_degrees(degrees: f64) -> Self {
        Self((degrees * MICROS_PER_DEGREE as f64).round() as i64)
    }

    pub fn degrees(self) -> f64 {
        self.0 as f64 / MICROS_PER_DEGREE as f64
    }

    /// Exact decimal parse, e.g. `"-33.868820"`. At most six fractional digits.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || whole.len() > 3 || frac.len() > 6 {
            return None;
        }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let whole: i64 = whole.parse().ok()?;
        let frac_bytes = frac.as_bytes();
        let mut micros = 0i64;
        for i in 0..6 {
            micros *= 10;
            if let Some(b) = frac_bytes.get(i) {
                micros += i64::from(b - b'0');
            }
        }
        let raw = whole * MICROS_PER_DEGREE + micros;
        Some(Self(if negative { -raw } else { raw }))
    }
}

impl fmt::Display for Microdegrees {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = MICROS_PER_DEGREE as u64;
        write!(f, "{sign}{}.{:06}", abs / scale, abs % scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: Microdegrees,
    pub longitude: Microdegrees,
}

impl Coordinates {
    pub fn new(latitude: Microdegrees, longitude: Microdegrees) -> Self {
        Self { latitude, longitude }
    }

    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self::new(Microdegrees::from_degrees(latitude), Microdegrees::from_degrees(longitude))
    }

    /// Latitude within [-90, 90] and longitude within [-180, 180].
    pub fn is_valid(&self) -> bool {
        let lat = self.latitude.raw();
        let lon = self.longitude.raw();
        (-90 * MICROS_PER_DEGREE..=90 * MICROS_PER_DEGREE).contains(&lat)
            && (-180 * MICROS_PER_DEGREE..=180 * MICROS_PER_DEGREE).contains(&lon)
    }

    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        crate::geo::distance_m(
            self.latitude.degrees(),
            self.longitude.degrees(),
            other.latitude.degrees(),
            other.longitude.degrees(),
        )
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: SpotId,
    pub coordinates: Coordinates,
    pub occupied: bool,
    pub occupation_ratio: f64,
    /// Bumped by the store on every committed write to the spot or its log.
    pub version: u64,
}

impl Spot {
    pub fn new(id: SpotId, coordinates: Coordinates) -> Self {
        Self {
            id,
            coordinates,
            occupied: false,
            occupation_ratio: PRIOR_RATIO,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Soft hold placed by a suggestion; reclaimed if never confirmed.
    Booking,
    /// The user confirmed arrival.
    Entering,
    /// Closed stay, waiting to be folded into a duration sample.
    Leaving,
    /// Manual fixed-horizon block (reported obstruction).
    Unavailable,
}

impl ReservationStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, ReservationStatus::Leaving)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Booking => "booking",
            ReservationStatus::Entering => "entering",
            ReservationStatus::Leaving => "leaving",
            ReservationStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// One entry of a spot's reservation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub id: EventId,
    pub spot_id: SpotId,
    pub user_id: UserId,
    pub status: ReservationStatus,
    /// Start of the span not yet accounted for by the estimator.
    pub enter_time: Ms,
    pub leave_time: Option<Ms>,
    /// Start of the current stay. The estimator never moves it.
    pub opened_at: Ms,
}

impl ReservationEvent {
    pub fn open(spot_id: SpotId, user_id: UserId, status: ReservationStatus, now: Ms) -> Self {
        Self {
            id: Ulid::new(),
            spot_id,
            user_id,
            status,
            enter_time: now,
            leave_time: None,
            opened_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSample {
    pub spot_id: SpotId,
    /// Occupied time accrued since the previous estimator tick.
    pub duration: Ms,
    pub record_time: Ms,
}

/// Checkpoint of the occupancy scheduler, persisted across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Total ticked time; the cumulative estimator's denominator base.
    pub total_time: Ms,
    /// Time between the last finished tick and shutdown.
    pub on_resume: Ms,
    pub last_started: Option<Ms>,
    pub last_finished: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// Mutation of a spot's log, committed together with the spot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOp {
    Append(ReservationEvent),
    Update(ReservationEvent),
    Delete(EventId),
}

/// One WAL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    SpotAdded { spot: Spot },
    SpotRemoved { id: SpotId },
    SpotWritten { spot: Spot, ops: Vec<EventOp> },
    SampleRecorded { sample: DurationSample },
    UserAdded { user: User },
    UserRemoved { id: UserId },
    SchedulerStateSaved { state: SchedulerState },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SpotInfo {
    pub id: SpotId,
    pub coordinates: Coordinates,
    pub occupied: bool,
    pub occupation_ratio: f64,
}

impl From<&Spot> for SpotInfo {
    fn from(spot: &Spot) -> Self {
        Self {
            id: spot.id,
            coordinates: spot.coordinates,
            occupied: spot.occupied,
            occupation_ratio: spot.occupation_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microdegrees_parse_exact() {
        assert_eq!(Microdegrees::parse("10.0001"), Some(Microdegrees::from_raw(10_000_100)));
        assert_eq!(Microdegrees::parse("-33.86882"), Some(Microdegrees::from_raw(-33_868_820)));
        assert_eq!(Microdegrees::parse("+7"), Some(Microdegrees::from_raw(7_000_000)));
        assert_eq!(Microdegrees::parse("0.000001"), Some(Microdegrees::from_raw(1)));
    }

    #[test]
    fn microdegrees_parse_rejects_garbage() {
        assert_eq!(Microdegrees::parse(""), None);
        assert_eq!(Microdegrees::parse(".5"), None);
        assert_eq!(Microdegrees::parse("1.2345678"), None); // seven digits
        assert_eq!(Microdegrees::parse("12a.5"), None);
        assert_eq!(Microdegrees::parse("1e3"), None);
        assert_eq!(Microdegrees::parse("1000.0"), None);
    }

    #[test]
    fn microdegrees_display() {
        assert_eq!(Microdegrees::from_raw(10_000_100).to_string(), "10.000100");
        assert_eq!(Microdegrees::from_raw(-500_000).to_string(), "-0.500000");
        assert_eq!(Microdegrees::from_raw(0).to_string(), "0.000000");
    }

    #[test]
    fn microdegrees_from_degrees_rounds() {
        assert_eq!(Microdegrees::from_degrees(10.0001), Microdegrees::from_raw(10_000_100));
        assert_eq!(Microdegrees::from_degrees(-0.0000004), Microdegrees::from_raw(0));
        assert!((Microdegrees::from_raw(20_000_100).degrees() - 20.0001).abs() < 1e-12);
    }

    #[test]
    fn coordinates_validity() {
        assert!(Coordinates::from_degrees(90.0, 180.0).is_valid());
        assert!(Coordinates::from_degrees(-90.0, -180.0).is_valid());
        assert!(!Coordinates::from_degrees(90.000001, 0.0).is_valid());
        assert!(!Coordinates::from_degrees(0.0, -180.5).is_valid());
    }

    #[test]
    fn new_spot_starts_free_with_prior() {
        let spot = Spot::new(Ulid::new(), Coordinates::from_degrees(1.0, 2.0));
        assert!(!spot.occupied);
        assert_eq!(spot.occupation_ratio, PRIOR_RATIO);
        assert_eq!(spot.version, 0);
    }

    #[test]
    fn open_statuses() {
        assert!(ReservationStatus::Booking.is_open());
        assert!(ReservationStatus::Entering.is_open());
        assert!(ReservationStatus::Unavailable.is_open());
        assert!(!ReservationStatus::Leaving.is_open());
    }

    #[test]
    fn open_event_sets_both_clocks() {
        let ev = ReservationEvent::open(Ulid::new(), Ulid::new(), ReservationStatus::Booking, 42);
        assert_eq!(ev.enter_time, 42);
        assert_eq!(ev.opened_at, 42);
        assert_eq!(ev.leave_time, None);
    }

    #[test]
    fn record_serialization_roundtrip() {
        let spot = Spot::new(Ulid::new(), Coordinates::from_degrees(10.0, 20.0));
        let record = Record::SpotWritten {
            spot: spot.clone(),
            ops: vec![EventOp::Append(ReservationEvent::open(
                spot.id,
                Ulid::new(),
                ReservationStatus::Unavailable,
                1_000,
            ))],
        };
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
