use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::*;
use crate::wal::Wal;

use super::{SpotStore, SpotWrite, StoreError};

/// A spot row together with its unfolded reservation log.
#[derive(Debug)]
struct SpotState {
    spot: Spot,
    /// Oldest first.
    events: Vec<ReservationEvent>,
    /// Set when the spot is deleted while another task still holds the Arc.
    removed: bool,
}

type SharedSpotState = Arc<RwLock<SpotState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends: block for the first append, drain
/// whatever else is queued, then one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Reject a log mutation before it reaches the WAL.
fn check_ops(events: &[ReservationEvent], ops: &[EventOp]) -> Result<(), StoreError> {
    let mut known: HashSet<EventId> = events.iter().map(|e| e.id).collect();
    for op in ops {
        match op {
            EventOp::Append(ev) => {
                if !known.insert(ev.id) {
                    return Err(StoreError::AlreadyExists(ev.id));
                }
            }
            EventOp::Update(ev) => {
                if !known.contains(&ev.id) {
                    return Err(StoreError::UnknownEvent(ev.id));
                }
            }
            EventOp::Delete(id) => {
                if !known.remove(id) {
                    return Err(StoreError::UnknownEvent(*id));
                }
            }
        }
    }
    Ok(())
}

fn apply_ops(events: &mut Vec<ReservationEvent>, ops: &[EventOp]) {
    for op in ops {
        match op {
            EventOp::Append(ev) => events.push(ev.clone()),
            EventOp::Update(ev) => {
                if let Some(slot) = events.iter_mut().find(|e| e.id == ev.id) {
                    *slot = ev.clone();
                }
            }
            EventOp::Delete(id) => events.retain(|e| e.id != *id),
        }
    }
}

/// In-memory spot store made durable by a write-ahead log.
///
/// Writes to one spot are serialised by that spot's lock and checked against
/// the caller's expected version, which makes `upsert_spot` a compare-and-swap.
pub struct WalStore {
    spots: DashMap<SpotId, SharedSpotState>,
    users: DashMap<UserId, User>,
    samples: DashMap<SpotId, Vec<DurationSample>>,
    scheduler: RwLock<SchedulerState>,
    /// Commits hold this shared; compaction holds it exclusively so no commit
    /// lands between the snapshot and the file swap.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let records = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut spots: HashMap<SpotId, SpotState> = HashMap::new();
        let users = DashMap::new();
        let samples: DashMap<SpotId, Vec<DurationSample>> = DashMap::new();
        let mut scheduler = SchedulerState::default();

        for record in records {
            match record {
                Record::SpotAdded { spot } => {
                    spots.insert(
                        spot.id,
                        SpotState {
                            spot,
                            events: Vec::new(),
                            removed: false,
                        },
                    );
                }
                Record::SpotRemoved { id } => {
                    spots.remove(&id);
                    samples.remove(&id);
                }
                Record::SpotWritten { spot, ops } => {
                    if let Some(state) = spots.get_mut(&spot.id) {
                        apply_ops(&mut state.events, &ops);
                        state.spot = spot;
                    }
                }
                Record::SampleRecorded { sample } => {
                    samples.entry(sample.spot_id).or_default().push(sample);
                }
                Record::UserAdded { user } => {
                    users.insert(user.id, user);
                }
                Record::UserRemoved { id } => {
                    users.remove(&id);
                }
                Record::SchedulerStateSaved { state } => scheduler = state,
            }
        }

        Ok(Self {
            spots: spots
                .into_iter()
                .map(|(id, state)| (id, Arc::new(RwLock::new(state))))
                .collect(),
            users,
            samples,
            scheduler: RwLock::new(scheduler),
            commit_gate: RwLock::new(()),
            wal_tx,
        })
    }

    async fn wal_append(&self, record: Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    fn shared(&self, id: &SpotId) -> Option<SharedSpotState> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    fn all_shared(&self) -> Vec<SharedSpotState> {
        self.spots.iter().map(|e| e.value().clone()).collect()
    }

    /// Rewrite the WAL with only the records needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let mut records: Vec<Record> = self
            .users
            .iter()
            .map(|e| Record::UserAdded { user: e.value().clone() })
            .collect();

        for shared in self.all_shared() {
            let guard = shared.read().await;
            if guard.removed {
                continue;
            }
            records.push(Record::SpotAdded { spot: guard.spot.clone() });
            if !guard.events.is_empty() {
                records.push(Record::SpotWritten {
                    spot: guard.spot.clone(),
                    ops: guard.events.iter().cloned().map(EventOp::Append).collect(),
                });
            }
            if let Some(samples) = self.samples.get(&guard.spot.id) {
                records.extend(samples.iter().map(|s| Record::SampleRecorded { sample: *s }));
            }
        }

        records.push(Record::SchedulerStateSaved {
            state: *self.scheduler.read().await,
        });

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl SpotStore for WalStore {
    async fn get_spot(&self, id: SpotId) -> Result<Option<Spot>, StoreError> {
        let Some(shared) = self.shared(&id) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok((!guard.removed).then(|| guard.spot.clone()))
    }

    async fn list_spots(&self) -> Result<Vec<Spot>, StoreError> {
        let mut spots = Vec::with_capacity(self.spots.len());
        for shared in self.all_shared() {
            let guard = shared.read().await;
            if !guard.removed {
                spots.push(guard.spot.clone());
            }
        }
        spots.sort_by_key(|s| s.id);
        Ok(spots)
    }

    async fn insert_spot(&self, spot: Spot) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        if self.spots.contains_key(&spot.id) {
            return Err(StoreError::AlreadyExists(spot.id));
        }
        self.wal_append(Record::SpotAdded { spot: spot.clone() }).await?;
        let id = spot.id;
        self.spots.insert(
            id,
            Arc::new(RwLock::new(SpotState {
                spot,
                events: Vec::new(),
                removed: false,
            })),
        );
        Ok(())
    }

    async fn remove_spot(&self, id: SpotId, expected_version: u64) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.shared(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = shared.write().await;
        if guard.removed {
            return Err(StoreError::NotFound(id));
        }
        if guard.spot.version != expected_version {
            return Err(StoreError::VersionConflict {
                spot: id,
                expected: expected_version,
                actual: guard.spot.version,
            });
        }
        self.wal_append(Record::SpotRemoved { id }).await?;
        guard.removed = true;
        self.spots.remove(&id);
        self.samples.remove(&id);
        Ok(())
    }

    async fn upsert_spot(&self, write: SpotWrite) -> Result<Spot, StoreError> {
        let _gate = self.commit_gate.read().await;
        let id = write.spot.id;
        let shared = self.shared(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = shared.write().await;
        if guard.removed {
            return Err(StoreError::NotFound(id));
        }
        if guard.spot.version != write.expected_version {
            return Err(StoreError::VersionConflict {
                spot: id,
                expected: write.expected_version,
                actual: guard.spot.version,
            });
        }
        check_ops(&guard.events, &write.ops)?;

        let SpotWrite { mut spot, ops, .. } = write;
        spot.version = guard.spot.version + 1;
        self.wal_append(Record::SpotWritten {
            spot: spot.clone(),
            ops: ops.clone(),
        })
        .await?;

        apply_ops(&mut guard.events, &ops);
        guard.spot = spot.clone();
        Ok(spot)
    }

    async fn events_for(&self, spot: SpotId) -> Result<Vec<ReservationEvent>, StoreError> {
        let shared = self.shared(&spot).ok_or(StoreError::NotFound(spot))?;
        let guard = shared.read().await;
        Ok(guard.events.clone())
    }

    async fn booking_events_before(&self, cutoff: Ms) -> Result<Vec<ReservationEvent>, StoreError> {
        let mut stale = Vec::new();
        for shared in self.all_shared() {
            let guard = shared.read().await;
            if guard.removed {
                continue;
            }
            stale.extend(
                guard
                    .events
                    .iter()
                    .filter(|e| e.status == ReservationStatus::Booking && e.enter_time < cutoff)
                    .cloned(),
            );
        }
        Ok(stale)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        if self.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists(user.id));
        }
        self.wal_append(Record::UserAdded { user: user.clone() }).await?;
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn remove_user(&self, id: UserId) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        if !self.users.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.wal_append(Record::UserRemoved { id }).await?;
        self.users.remove(&id);
        Ok(())
    }

    async fn append_sample(&self, sample: DurationSample) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        if !self.spots.contains_key(&sample.spot_id) {
            return Err(StoreError::NotFound(sample.spot_id));
        }
        self.wal_append(Record::SampleRecorded { sample }).await?;
        self.samples.entry(sample.spot_id).or_default().push(sample);
        Ok(())
    }

    async fn recent_samples(&self, spot: SpotId, limit: usize) -> Result<Vec<DurationSample>, StoreError> {
        Ok(self
            .samples
            .get(&spot)
            .map(|s| s.iter().rev().take(limit).copied().collect())
            .unwrap_or_default())
    }

    async fn load_scheduler_state(&self) -> Result<SchedulerState, StoreError> {
        Ok(*self.scheduler.read().await)
    }

    async fn save_scheduler_state(&self, state: SchedulerState) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let mut current = self.scheduler.write().await;
        self.wal_append(Record::SchedulerStateSaved { state }).await?;
        *current = state;
        Ok(())
    }
}
