use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::engine::{Engine, EngineError};
use crate::estimator::OccupancyEstimator;
use crate::model::*;
use crate::observability::{TICK_DURATION_SECONDS, TICK_FAILURES_TOTAL};
use crate::reaper;
use crate::store::{SpotStore, WalStore};

/// How often the compactor looks at the WAL size.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

fn ms_to_duration(ms: Ms) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Owns the background loops: the stale-booking reclaimer, the occupancy
/// estimator and, when given a `WalStore`, the WAL compactor.
pub struct SchedulerSupervisor {
    store: Arc<dyn SpotStore>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SchedulerState>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerSupervisor {
    /// Load the checkpoint and spawn the loops. The first estimator tick
    /// waits only what was left of the interval when the process stopped.
    pub async fn start(
        engine: Arc<Engine>,
        estimator: Arc<OccupancyEstimator>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        compactor: Option<Arc<WalStore>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let store = engine.store().clone();
        let loaded = store.load_scheduler_state().await?;
        info!(
            "scheduler starting: total_time={}ms on_resume={}ms",
            loaded.total_time, loaded.on_resume
        );
        let state = Arc::new(Mutex::new(loaded));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(reclaim_loop(
            engine.clone(),
            clock.clone(),
            config.booking_grace,
            ms_to_duration(config.reclaim_interval),
            cancel.child_token(),
        )));

        let first_tick = ms_to_duration(config.tick.saturating_sub(loaded.on_resume));
        tasks.push(tokio::spawn(estimate_loop(
            estimator,
            store.clone(),
            clock.clone(),
            state.clone(),
            config.tick,
            first_tick,
            cancel.child_token(),
        )));

        if let Some(wal_store) = compactor.filter(|_| config.compact_threshold > 0) {
            tasks.push(tokio::spawn(compact_loop(
                wal_store,
                config.compact_threshold,
                cancel.child_token(),
            )));
        }

        Ok(Self {
            store,
            clock,
            state,
            cancel,
            tasks,
        })
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.lock().await
    }

    /// Stop every loop, wait for a running tick to finish, then persist the
    /// checkpoint with the time elapsed since the last finished tick.
    pub async fn shutdown(self) -> Result<SchedulerState, EngineError> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("scheduler task ended abnormally: {e}");
            }
        }
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.on_resume = state.last_finished.map_or(0, |f| now.saturating_sub(f).max(0));
        self.store.save_scheduler_state(*state).await?;
        info!("scheduler stopped, on_resume={}ms", state.on_resume);
        Ok(*state)
    }
}

async fn reclaim_loop(
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    grace: Ms,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let started = std::time::Instant::now();
        match reaper::reclaim_stale_bookings(&engine, clock.now(), grace).await {
            Ok(0) => debug!("no stale bookings"),
            Ok(n) => info!("reclaimed {n} stale bookings"),
            Err(e) => {
                metrics::counter!(TICK_FAILURES_TOTAL, "process" => "reclaimer").increment(1);
                warn!("reclaimer tick failed, retrying next interval: {e}");
            }
        }
        metrics::histogram!(TICK_DURATION_SECONDS, "process" => "reclaimer")
            .record(started.elapsed().as_secs_f64());
    }
}

async fn estimate_loop(
    estimator: Arc<OccupancyEstimator>,
    store: Arc<dyn SpotStore>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SchedulerState>>,
    tick: Ms,
    first_tick: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + first_tick, ms_to_duration(tick));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let started = std::time::Instant::now();
        let now = clock.now();
        let snapshot = {
            let mut st = state.lock().await;
            st.last_started = Some(now);
            *st
        };

        match estimator.run_tick(now, &snapshot).await {
            Ok(report) => {
                let checkpoint = {
                    let mut st = state.lock().await;
                    st.total_time += tick;
                    st.last_finished = Some(clock.now());
                    st.on_resume = 0;
                    *st
                };
                info!(
                    "estimator tick: {} spots, {} free, {} skipped, total_time={}ms",
                    report.spots, report.free_spots, report.skipped, checkpoint.total_time
                );
                if let Err(e) = store.save_scheduler_state(checkpoint).await {
                    warn!("failed to checkpoint scheduler state: {e}");
                }
            }
            Err(e) => {
                metrics::counter!(TICK_FAILURES_TOTAL, "process" => "estimator").increment(1);
                warn!("estimator tick failed, retrying next interval: {e}");
            }
        }
        metrics::histogram!(TICK_DURATION_SECONDS, "process" => "estimator")
            .record(started.elapsed().as_secs_f64());
    }
}

async fn compact_loop(store: Arc<WalStore>, threshold: u64, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + COMPACT_CHECK_INTERVAL, COMPACT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
