use crate::config::{EstimatorConfig, EstimatorKind};
use crate::model::{DurationSample, Ms};

/// Turns a spot's recent duration samples into a new occupation ratio.
pub trait OccupancyModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// How many of the newest samples `estimate` wants to see.
    fn window(&self) -> usize;

    /// New ratio for a spot, or `None` to leave it as it is.
    ///
    /// `samples` is newest first and holds at most `window()` entries.
    /// `total_time` is the time ticked before the current tick.
    fn estimate(&self, prior: f64, samples: &[DurationSample], total_time: Ms, tick: Ms) -> Option<f64>;
}

pub fn create_model(config: &EstimatorConfig) -> Box<dyn OccupancyModel> {
    match config.model {
        EstimatorKind::Cumulative => Box::new(Cumulative),
        EstimatorKind::Moving => Box::new(Moving {
            window: config.moving_window,
        }),
        EstimatorKind::WeightedMoving => Box::new(WeightedMoving {
            window: config.moving_window,
        }),
    }
}

fn clamp_ratio(r: f64) -> f64 {
    if r.is_nan() { 0.0 } else { r.clamp(0.0, 1.0) }
}

/// Running average over all ticked time: `(r·T + d) / (T + Δ)`.
#[derive(Debug, Clone, Copy)]
pub struct Cumulative;

impl OccupancyModel for Cumulative {
    fn name(&self) -> &'static str {
        "cumulative"
    }

    fn window(&self) -> usize {
        1
    }

    fn estimate(&self, prior: f64, samples: &[DurationSample], total_time: Ms, tick: Ms) -> Option<f64> {
        let d = samples.first().map_or(0, |s| s.duration) as f64;
        let t = total_time.max(0) as f64;
        let denominator = t + tick as f64;
        if denominator <= 0.0 {
            return None;
        }
        Some(clamp_ratio((prior * t + d) / denominator))
    }
}

/// Plain average of the last `window` ticks.
#[derive(Debug, Clone, Copy)]
pub struct Moving {
    pub window: usize,
}

impl OccupancyModel for Moving {
    fn name(&self) -> &'static str {
        "moving"
    }

    fn window(&self) -> usize {
        self.window
    }

    fn estimate(&self, _prior: f64, samples: &[DurationSample], _total_time: Ms, tick: Ms) -> Option<f64> {
        let n = self.window;
        if n == 0 || samples.len() < n || tick <= 0 {
            return None;
        }
        let sum: f64 = samples[..n].iter().map(|s| s.duration as f64).sum();
        Some(clamp_ratio(sum / (n as f64 * tick as f64)))
    }
}

/// Linearly weighted average of the last `window` ticks, newest weighted `N`,
/// oldest weighted 1.
#[derive(Debug, Clone, Copy)]
pub struct WeightedMoving {
    pub window: usize,
}

impl OccupancyModel for WeightedMoving {
    fn name(&self) -> &'static str {
        "weighted_moving"
    }

    fn window(&self) -> usize {
        self.window
    }

    fn estimate(&self, _prior: f64, samples: &[DurationSample], _total_time: Ms, tick: Ms) -> Option<f64> {
        let n = self.window;
        if n == 0 || samples.len() < n || tick <= 0 {
            return None;
        }
        let weighted: f64 = samples[..n]
            .iter()
            .enumerate()
            .map(|(i, s)| (n - i) as f64 * s.duration as f64)
            .sum();
        let weights = (n * (n + 1) / 2) as f64;
        Some(clamp_ratio(weighted / (weights * tick as f64)))
    }
}
