use std::sync::Arc;

use tracing::{info, warn};

use spotwise::clock::{now_ms, Clock, SimulatedClock, SystemClock};
use spotwise::config::{ClockMode, Config};
use spotwise::engine::Engine;
use spotwise::estimator::OccupancyEstimator;
use spotwise::scheduler::SchedulerSupervisor;
use spotwise::service::ParkingService;
use spotwise::store::{SpotStore, WalStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    spotwise::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("spotwise.wal");
    let wal_store = Arc::new(WalStore::open(wal_path.clone())?);
    let store: Arc<dyn SpotStore> = wal_store.clone();

    let clock: Arc<dyn Clock> = match config.clock {
        ClockMode::Realtime => Arc::new(SystemClock),
        ClockMode::Simulation => {
            warn!("simulation clock: time only moves when driven through the library API");
            Arc::new(SimulatedClock::new(now_ms()))
        }
    };

    let engine = Arc::new(Engine::new(store, config.engine.clone()));
    let estimator = Arc::new(OccupancyEstimator::new(engine.clone(), config.estimator.clone()));
    let supervisor = SchedulerSupervisor::start(
        engine.clone(),
        estimator,
        config.scheduler.clone(),
        clock.clone(),
        Some(wal_store.clone()),
    )
    .await?;
    let service = ParkingService::new(engine, clock);

    let spots = service.list_spots().await?;
    info!("spotwise running");
    info!("  wal: {}", wal_path.display());
    info!("  spots: {} ({} free)", spots.len(), spots.iter().filter(|s| !s.occupied).count());
    info!("  estimator: {:?}, tick {}ms", config.estimator.model, config.estimator.tick);
    info!("  block expiry: {:?}", config.estimator.block_expiry);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c: stop the loops, checkpoint the scheduler
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutting down");
    let state = supervisor.shutdown().await?;
    info!("scheduler checkpoint saved (total_time={}ms)", state.total_time);
    wal_store.compact().await?;
    Ok(())
}
