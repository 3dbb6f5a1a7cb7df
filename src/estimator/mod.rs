pub mod models;

pub use models::{create_model, OccupancyModel};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BlockExpiry, EstimatorConfig};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::store::SpotWrite;

/// What one tick's fold does to a single spot's log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoldOutcome {
    /// Occupied time accrued since the previous tick.
    pub duration: Ms,
    pub ops: Vec<EventOp>,
    /// The spot has no open event left once `ops` are applied.
    pub frees_spot: bool,
    pub abandoned: usize,
    pub expired_blocks: usize,
}

fn span(from: Ms, to: Ms) -> Ms {
    to.saturating_sub(from).max(0)
}

/// Fold a spot's log into the time it was occupied since the last tick.
///
/// Open bookings are never folded: a soft hold is not occupation. Closed
/// stays are accrued and dropped from the log. Long-lived events (confirmed
/// stays and blocks) are accrued up to `now` and their `enter_time` moves to
/// `now` so the next tick only counts what comes after.
pub fn fold_events(events: &[ReservationEvent], now: Ms, cfg: &EstimatorConfig) -> FoldOutcome {
    let mut out = FoldOutcome::default();
    let mut open_left = false;
    let mut closed_any = false;

    let carry = |ev: &ReservationEvent, out: &mut FoldOutcome| {
        out.duration += span(ev.enter_time, now);
        let mut next = ev.clone();
        next.enter_time = now;
        out.ops.push(EventOp::Update(next));
    };

    for ev in events {
        match ev.status {
            ReservationStatus::Booking => open_left = true,
            ReservationStatus::Leaving => {
                out.duration += span(ev.enter_time, ev.leave_time.unwrap_or(now));
                out.ops.push(EventOp::Delete(ev.id));
            }
            ReservationStatus::Entering => {
                if span(ev.opened_at, now) > cfg.max_occupation {
                    out.duration += span(ev.enter_time, now);
                    out.ops.push(EventOp::Delete(ev.id));
                    out.abandoned += 1;
                    closed_any = true;
                } else {
                    carry(ev, &mut out);
                    open_left = true;
                }
            }
            ReservationStatus::Unavailable => {
                let leave = ev.leave_time.unwrap_or(now);
                let expiring = leave.saturating_sub(ev.enter_time) <= cfg.tick;
                if expiring && cfg.block_expiry == BlockExpiry::Auto {
                    out.duration += span(ev.enter_time, leave);
                    out.ops.push(EventOp::Delete(ev.id));
                    out.expired_blocks += 1;
                    closed_any = true;
                } else {
                    carry(ev, &mut out);
                    open_left = true;
                }
            }
        }
    }
    out.frees_spot = closed_any && !open_left;
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub spots: usize,
    /// Spots skipped because they were deleted or kept changing mid-tick.
    pub skipped: usize,
    pub occupied_time: Ms,
    pub abandoned: usize,
    pub expired_blocks: usize,
    pub free_spots: usize,
}

/// Periodically re-derives each spot's occupation ratio from its history.
pub struct OccupancyEstimator {
    engine: Arc<Engine>,
    config: EstimatorConfig,
    model: Box<dyn OccupancyModel>,
}

impl OccupancyEstimator {
    pub fn new(engine: Arc<Engine>, config: EstimatorConfig) -> Self {
        let model = create_model(&config);
        info!("occupancy estimator using the {} model", model.name());
        Self { engine, config, model }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// One estimation pass over every spot: fold the log into a sample,
    /// record it, then recompute the ratio from the recent samples.
    ///
    /// Only a failure to list the spots fails the tick. Per-spot failures
    /// skip that spot, so no spot is ever sampled twice against one
    /// `total_time`.
    pub async fn run_tick(&self, now: Ms, state: &SchedulerState) -> Result<TickReport, EngineError> {
        let spots = self.engine.store().list_spots().await?;
        let mut report = TickReport {
            spots: spots.len(),
            ..TickReport::default()
        };

        for spot in spots {
            let (folded, updated) = match self.tick_spot(spot.id, now, state.total_time).await {
                Ok(done) => done,
                Err(EngineError::NotFound(_)) => {
                    debug!("spot {} deleted mid-tick", spot.id);
                    report.skipped += 1;
                    continue;
                }
                Err(EngineError::Conflict(_)) => {
                    warn!("spot {} kept changing, fold deferred to next tick", spot.id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("spot {} skipped this tick: {e}", spot.id);
                    report.skipped += 1;
                    continue;
                }
            };

            report.occupied_time += folded.duration;
            report.abandoned += folded.abandoned;
            report.expired_blocks += folded.expired_blocks;
            if !updated.occupied {
                report.free_spots += 1;
            }
        }

        if report.abandoned > 0 {
            metrics::counter!(crate::observability::ABANDONED_STAYS_TOTAL).increment(report.abandoned as u64);
        }
        if report.expired_blocks > 0 {
            metrics::counter!(crate::observability::EXPIRED_BLOCKS_TOTAL).increment(report.expired_blocks as u64);
        }
        metrics::gauge!(crate::observability::SPOTS_FREE).set(report.free_spots as f64);
        Ok(report)
    }

    /// Fold, sample and recompute one spot. A failure here costs only this
    /// spot its update for the tick.
    async fn tick_spot(&self, spot_id: SpotId, now: Ms, total_time: Ms) -> Result<(FoldOutcome, Spot), EngineError> {
        let folded = self.fold_spot(spot_id, now).await?;
        self.engine
            .store()
            .append_sample(DurationSample {
                spot_id,
                duration: folded.duration,
                record_time: now,
            })
            .await?;
        let updated = self.recompute(spot_id, total_time).await?;
        Ok((folded, updated))
    }

    /// Commit the fold of one spot's log. A write racing with the fold
    /// forces a re-read and a fresh fold.
    async fn fold_spot(&self, spot_id: SpotId, now: Ms) -> Result<FoldOutcome, EngineError> {
        let committed = self
            .engine
            .maybe_commit_with_retry(spot_id, |spot, events| {
                let folded = fold_events(events, now, &self.config);
                if folded.ops.is_empty() {
                    return Ok(None);
                }
                let mut next = spot;
                if folded.frees_spot {
                    next.occupied = false;
                }
                let write = SpotWrite {
                    expected_version: next.version,
                    spot: next,
                    ops: folded.ops.clone(),
                };
                Ok(Some((write, folded)))
            })
            .await?;

        let Some((_, folded)) = committed else {
            return Ok(FoldOutcome::default());
        };
        for _ in 0..folded.abandoned {
            warn!("closed abandoned stay on spot {spot_id}");
        }
        if folded.expired_blocks > 0 {
            info!("block on spot {spot_id} expired");
        }
        Ok(folded)
    }

    /// Apply the configured model to the spot's newest samples and store the
    /// new ratio. Returns the spot as stored.
    pub async fn recompute(&self, spot_id: SpotId, total_time: Ms) -> Result<Spot, EngineError> {
        let samples = self
            .engine
            .store()
            .recent_samples(spot_id, self.model.window())
            .await?;
        let committed = self
            .engine
            .maybe_commit_with_retry(spot_id, |spot, _| {
                let Some(ratio) = self
                    .model
                    .estimate(spot.occupation_ratio, &samples, total_time, self.config.tick)
                else {
                    return Ok(None);
                };
                let mut next = spot;
                next.occupation_ratio = ratio;
                Ok(Some((SpotWrite::from_read(next), ())))
            })
            .await?;
        match committed {
            Some((stored, ())) => {
                debug!("spot {spot_id} occupation ratio now {:.4}", stored.occupation_ratio);
                Ok(stored)
            }
            None => self.engine.require_spot(spot_id).await,
        }
    }
}
