use crate::model::{HOUR, Ms};

pub const MAX_SPOTS: usize = 100_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_USER_NAME_LEN: usize = 256;

/// Attempts at a per-spot compare-and-swap before giving up with `Conflict`.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Largest window the moving estimators accept.
pub const MAX_MOVING_WINDOW: usize = 1_000;

/// Upper bound for any configured interval or duration (one year).
pub const MAX_CONFIG_DURATION_MS: Ms = 24 * 365 * HOUR;
