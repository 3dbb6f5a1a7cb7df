use std::sync::Arc;

use proptest::prelude::*;
use ulid::Ulid;

use spotwise::config::{BlockExpiry, EngineConfig, EstimatorConfig};
use spotwise::engine::Engine;
use spotwise::estimator::OccupancyEstimator;
use spotwise::model::*;
use spotwise::reaper::reclaim_stale_bookings;
use spotwise::store::WalStore;

const T0: Ms = 1_700_000_000_000;
const TICK: Ms = 10 * MINUTE;
const GRACE: Ms = 15 * MINUTE;
const SPOTS: usize = 3;
const USERS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Suggest { user: usize },
    Favourite { user: usize, spot: usize },
    Enter { user: usize, spot: usize },
    Exit { user: usize, spot: usize },
    Block { user: usize, spot: usize },
    Clear { user: usize, spot: usize },
    DeleteSpot { spot: usize },
    Reclaim,
    Tick,
    Advance { minutes: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    let user = 0..USERS;
    let spot = 0..SPOTS;
    prop_oneof![
        user.clone().prop_map(|user| Op::Suggest { user }),
        (user.clone(), spot.clone()).prop_map(|(user, spot)| Op::Favourite { user, spot }),
        (user.clone(), spot.clone()).prop_map(|(user, spot)| Op::Enter { user, spot }),
        (user.clone(), spot.clone()).prop_map(|(user, spot)| Op::Exit { user, spot }),
        (user.clone(), spot.clone()).prop_map(|(user, spot)| Op::Block { user, spot }),
        (user, spot.clone()).prop_map(|(user, spot)| Op::Clear { user, spot }),
        spot.prop_map(|spot| Op::DeleteSpot { spot }),
        Just(Op::Reclaim),
        Just(Op::Tick),
        (1i64..120).prop_map(|minutes| Op::Advance { minutes }),
    ]
}

/// Every spot is occupied exactly when it has one open event, and ratios stay in range.
async fn check_invariants(engine: &Engine) -> Result<(), TestCaseError> {
    for spot in engine.store().list_spots().await.unwrap() {
        let events = engine.events_for(spot.id).await.unwrap();
        let open = events.iter().filter(|e| e.is_open()).count();
        prop_assert!(open <= 1, "spot {} has {open} open events", spot.id);
        prop_assert_eq!(spot.occupied, open == 1, "spot {} occupied={} open={}", spot.id, spot.occupied, open);
        prop_assert!((0.0..=1.0).contains(&spot.occupation_ratio));
    }
    Ok(())
}

async fn run(ops: Vec<Op>, block_expiry: BlockExpiry) -> Result<(), TestCaseError> {
    let dir = std::env::temp_dir().join("spotwise_test_invariant");
    std::fs::create_dir_all(&dir).unwrap();
    let store = WalStore::open(dir.join(format!("{}.wal", Ulid::new()))).unwrap();
    let engine = Arc::new(Engine::new(Arc::new(store), EngineConfig::default()));
    let estimator = OccupancyEstimator::new(
        engine.clone(),
        EstimatorConfig {
            tick: TICK,
            block_expiry,
            ..EstimatorConfig::default()
        },
    );

    let mut spots = Vec::new();
    for i in 0..SPOTS {
        let at = Coordinates::from_degrees(10.0 + i as f64 * 0.001, 20.0);
        spots.push(engine.add_spot(at).await.unwrap().id);
    }
    let mut users = Vec::new();
    for i in 0..USERS {
        users.push(engine.add_user(&format!("user{i}")).await.unwrap().id);
    }

    let mut now = T0;
    let mut total_time = 0;
    for op in ops {
        // Errors are expected for many random operations; only state matters.
        match op {
            Op::Suggest { user } => {
                let _ = engine
                    .suggest_spot(Coordinates::from_degrees(10.0, 20.0), users[user], now)
                    .await;
            }
            Op::Favourite { user, spot } => {
                let _ = engine.check_favourite(users[user], spots[spot], now).await;
            }
            Op::Enter { user, spot } => {
                let _ = engine.confirm_entry(users[user], spots[spot], now).await;
            }
            Op::Exit { user, spot } => {
                let _ = engine.confirm_exit(users[user], spots[spot], now).await;
            }
            Op::Block { user, spot } => {
                let _ = engine.report_blocking(users[user], spots[spot], now).await;
            }
            Op::Clear { user, spot } => {
                let _ = engine.clear_blocking(users[user], spots[spot], now).await;
            }
            Op::DeleteSpot { spot } => {
                let _ = engine.delete_spot(spots[spot]).await;
            }
            Op::Reclaim => {
                let first = reclaim_stale_bookings(&engine, now, GRACE).await.unwrap();
                let second = reclaim_stale_bookings(&engine, now, GRACE).await.unwrap();
                prop_assert_eq!(second, 0, "reclaimed {} then {}", first, second);
            }
            Op::Tick => {
                let state = SchedulerState {
                    total_time,
                    ..SchedulerState::default()
                };
                estimator.run_tick(now, &state).await.unwrap();
                total_time += TICK;
            }
            Op::Advance { minutes } => now += minutes * MINUTE,
        }
        check_invariants(&engine).await?;
    }
    Ok(())
}

fn block_on(fut: impl std::future::Future<Output = Result<(), TestCaseError>>) -> Result<(), TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn occupied_iff_open_event_auto_expiry(ops in prop::collection::vec(op(), 1..60)) {
        block_on(run(ops, BlockExpiry::Auto))?;
    }

    #[test]
    fn occupied_iff_open_event_manual_expiry(ops in prop::collection::vec(op(), 1..60)) {
        block_on(run(ops, BlockExpiry::Manual))?;
    }
}
