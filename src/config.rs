use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::*;
use crate::model::{HOUR, MINUTE, Ms};

/// Which occupancy model the estimator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorKind {
    Cumulative,
    Moving,
    WeightedMoving,
}

impl FromStr for EstimatorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Ok(EstimatorKind::Cumulative),
            "moving" => Ok(EstimatorKind::Moving),
            "weighted" | "weighted_moving" => Ok(EstimatorKind::WeightedMoving),
            _ => Err(()),
        }
    }
}

/// What happens to a manual block once its horizon is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExpiry {
    /// The estimator frees the spot.
    Auto,
    /// The spot stays blocked until `clear_blocking`.
    Manual,
}

impl FromStr for BlockExpiry {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BlockExpiry::Auto),
            "manual" => Ok(BlockExpiry::Manual),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Realtime,
    Simulation,
}

impl FromStr for ClockMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "realtime" => Ok(ClockMode::Realtime),
            "simulation" => Ok(ClockMode::Simulation),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Horizon of a manual block.
    pub block_duration: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_duration: HOUR,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// The estimation tick Δ.
    pub tick: Ms,
    /// Entered stays older than this are treated as abandoned.
    pub max_occupation: Ms,
    /// N for the moving models.
    pub moving_window: usize,
    pub model: EstimatorKind,
    pub block_expiry: BlockExpiry,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            tick: 10 * MINUTE,
            max_occupation: 24 * HOUR,
            moving_window: 6,
            model: EstimatorKind::Cumulative,
            block_expiry: BlockExpiry::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Estimator interval; same value as `EstimatorConfig::tick`.
    pub tick: Ms,
    /// Bookings unconfirmed for longer than this are reclaimed.
    pub booking_grace: Ms,
    pub reclaim_interval: Ms,
    /// WAL appends before the compactor rewrites the log. 0 disables it.
    pub compact_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: 10 * MINUTE,
            booking_grace: 15 * MINUTE,
            reclaim_interval: 15 * MINUTE,
            compact_threshold: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Every period must be positive; tokio timers reject a zero interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            (self.tick, "scheduler tick"),
            (self.booking_grace, "booking grace period"),
            (self.reclaim_interval, "reclaim interval"),
        ];
        for (value, what) in periods {
            if value <= 0 || value > MAX_CONFIG_DURATION_MS {
                return Err(ConfigError::OutOfRange(what));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub clock: ClockMode,
    pub engine: EngineConfig,
    pub estimator: EstimatorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            clock: ClockMode::Realtime,
            engine: EngineConfig::default(),
            estimator: EstimatorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    OutOfRange(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::OutOfRange(what) => write!(f, "out of range: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    /// Read `SPOTWISE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(dir) = lookup("SPOTWISE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.metrics_port = parse_var(&lookup, "SPOTWISE_METRICS_PORT")?;
        if let Some(mode) = parse_var(&lookup, "SPOTWISE_CLOCK")? {
            cfg.clock = mode;
        }

        if let Some(m) = parse_var::<i64>(&lookup, "SPOTWISE_TICK_MINUTES")? {
            cfg.estimator.tick = m.saturating_mul(MINUTE);
            cfg.scheduler.tick = cfg.estimator.tick;
        }
        if let Some(m) = parse_var::<i64>(&lookup, "SPOTWISE_BOOKING_GRACE_MINUTES")? {
            cfg.scheduler.booking_grace = m.saturating_mul(MINUTE);
            cfg.scheduler.reclaim_interval = cfg.scheduler.booking_grace;
        }
        if let Some(m) = parse_var::<i64>(&lookup, "SPOTWISE_RECLAIM_INTERVAL_MINUTES")? {
            cfg.scheduler.reclaim_interval = m.saturating_mul(MINUTE);
        }
        if let Some(m) = parse_var::<i64>(&lookup, "SPOTWISE_BLOCK_MINUTES")? {
            cfg.engine.block_duration = m.saturating_mul(MINUTE);
        }
        if let Some(h) = parse_var::<i64>(&lookup, "SPOTWISE_MAX_OCCUPATION_HOURS")? {
            cfg.estimator.max_occupation = h.saturating_mul(HOUR);
        }
        if let Some(n) = parse_var(&lookup, "SPOTWISE_MOVING_WINDOW")? {
            cfg.estimator.moving_window = n;
        }
        if let Some(kind) = parse_var(&lookup, "SPOTWISE_ESTIMATOR")? {
            cfg.estimator.model = kind;
        }
        if let Some(expiry) = parse_var(&lookup, "SPOTWISE_BLOCK_EXPIRY")? {
            cfg.estimator.block_expiry = expiry;
        }
        if let Some(n) = parse_var(&lookup, "SPOTWISE_COMPACT_THRESHOLD")? {
            cfg.scheduler.compact_threshold = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            (self.estimator.tick, "estimation tick"),
            (self.engine.block_duration, "block duration"),
            (self.estimator.max_occupation, "max occupation"),
        ];
        for (value, what) in durations {
            if value <= 0 || value > MAX_CONFIG_DURATION_MS {
                return Err(ConfigError::OutOfRange(what));
            }
        }
        self.scheduler.validate()?;
        if self.estimator.moving_window == 0 || self.estimator.moving_window > MAX_MOVING_WINDOW {
            return Err(ConfigError::OutOfRange("moving window"));
        }
        Ok(())
    }
}
