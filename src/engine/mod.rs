mod admin;
mod allocator;
mod audit;
mod compaction;
mod error;
mod queries;

pub use admin::NewPool;
pub use error::{EngineError, Rejection};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, broadcast, mpsc, oneshot,
};
use ulid::Ulid;

use crate::limits::LOCK_TIMEOUT_MS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPoolState = Arc<RwLock<PoolState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// committed together with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit failed for {} events: {e}", batch.len());
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// One tenant's pools, ledgers and configuration.
pub struct Engine {
    pub state: DashMap<Ulid, SharedPoolState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Booking id → pool id.
    pub(super) booking_to_pool: DashMap<Ulid, Ulid>,
    /// Date + shift + region → pool id.
    pub(super) slots: DashMap<SlotKey, Ulid>,
    /// Worker id → rating tier.
    pub(super) workers: DashMap<Ulid, u8>,
    pub(super) config: RwLock<TenantConfig>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight event.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a pool-scoped event. The caller holds the pool's write lock.
fn apply_to_pool(ps: &mut PoolState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PoolCapacitySet { capacity, promoted, .. } => {
            ps.capacity = *capacity;
            for id in promoted {
                promote(ps, id);
            }
        }
        Event::PoolActiveSet { active, .. } => ps.active = *active,
        Event::PoolReservationsSet { allowed, .. } => ps.reservations_allowed = *allowed,
        Event::BookingPlaced {
            id,
            pool_id,
            worker_id,
            kind,
            created_at,
            notes,
        } => {
            let status = match kind {
                BookingKind::Seat => BookingStatus::Confirmed,
                BookingKind::Reservation => BookingStatus::Pending,
            };
            ps.bookings.push(Booking {
                id: *id,
                pool_id: *pool_id,
                worker_id: *worker_id,
                kind: *kind,
                status,
                created_at: *created_at,
                cancelled_at: None,
                notes: notes.clone(),
            });
            if status == BookingStatus::Confirmed {
                ps.occupied_cached += 1;
            }
            booking_index.insert(*id, *pool_id);
        }
        Event::BookingCancelled {
            id,
            cancelled_at,
            promoted,
            ..
        } => {
            if let Some(b) = ps.booking_mut(id) {
                let held_seat = b.status == BookingStatus::Confirmed;
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*cancelled_at);
                if held_seat {
                    ps.occupied_cached = ps.occupied_cached.saturating_sub(1);
                }
            }
            if let Some(next) = promoted {
                promote(ps, next);
            }
        }
        Event::OccupancyReconciled { after, .. } => ps.occupied_cached = *after,
        // Pool creation, snapshots, tiers and config are applied at engine level.
        Event::PoolCreated { .. }
        | Event::PoolSnapshot { .. }
        | Event::WorkerTierSet { .. }
        | Event::ConfigUpdated { .. } => {}
    }
}

fn promote(ps: &mut PoolState, id: &Ulid) {
    if let Some(b) = ps.booking_mut(id)
        && b.status == BookingStatus::Pending
    {
        b.kind = BookingKind::Seat;
        b.status = BookingStatus::Confirmed;
        ps.occupied_cached += 1;
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_pool: DashMap::new(),
            slots: DashMap::new(),
            workers: DashMap::new(),
            config: RwLock::new(TenantConfig::default()),
            commit_gate: RwLock::new(()),
        };

        // Sole owner of every lock during replay: try_* never contends. Blocking
        // lock calls are off-limits because this may run inside the runtime.
        for event in &events {
            if engine.apply_global(event) {
                continue;
            }
            if let Some(pool_id) = event.pool_id()
                && let Some(shared) = engine.get_pool(&pool_id)
            {
                let mut guard = shared.try_write().expect("replay: uncontended write");
                apply_to_pool(&mut guard, event, &engine.booking_to_pool);
            }
        }
        if !events.is_empty() {
            tracing::info!("replayed {} events into {} pools", events.len(), engine.state.len());
            if let Ok(config) = engine.config.try_read() {
                crate::gate::report_defects(&config);
            }
        }

        Ok(engine)
    }

    /// Apply events that are not scoped to an existing pool. Returns `false`
    /// for pool-scoped events, which the caller applies under the pool lock.
    pub(super) fn apply_global(&self, event: &Event) -> bool {
        match event {
            Event::PoolCreated {
                id,
                date,
                shift,
                region_id,
                capacity,
                reservations_allowed,
                created_at,
            } => {
                let ps = PoolState::new(
                    *id,
                    *date,
                    shift.clone(),
                    *region_id,
                    *capacity,
                    *reservations_allowed,
                    *created_at,
                );
                self.slots.insert(ps.slot_key(), *id);
                self.state.insert(*id, Arc::new(RwLock::new(ps)));
                true
            }
            Event::PoolSnapshot { pool, bookings } => {
                for b in bookings {
                    self.booking_to_pool.insert(b.id, pool.id);
                }
                let ps = PoolState::from_record(pool.clone(), bookings.clone());
                self.slots.insert(ps.slot_key(), ps.id);
                self.state.insert(ps.id, Arc::new(RwLock::new(ps)));
                true
            }
            Event::WorkerTierSet { worker_id, tier } => {
                self.workers.insert(*worker_id, *tier);
                true
            }
            Event::ConfigUpdated { config } => {
                match self.config.try_write() {
                    Ok(mut guard) => *guard = config.clone(),
                    Err(_) => tracing::error!("config lock contended while applying update"),
                }
                true
            }
            _ => false,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply and notify a pool-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PoolState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_pool(ps, event, &self.booking_to_pool);
        self.notify.send(ps.id, event);
        Ok(())
    }

    pub fn get_pool(&self, id: &Ulid) -> Option<SharedPoolState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn pool_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_pool.get(booking_id).map(|e| *e.value())
    }

    pub fn subscribe(&self, pool_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(pool_id)
    }

    pub async fn config(&self) -> TenantConfig {
        self.config.read().await.clone()
    }

    pub fn worker_tier(&self, worker_id: &Ulid) -> Option<u8> {
        self.workers.get(worker_id).map(|e| *e.value())
    }

    /// Exclusive access to one pool, bounded by `LOCK_TIMEOUT_MS`.
    pub(super) async fn lock_pool(
        &self,
        pool_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PoolState>, EngineError> {
        let shared = self.get_pool(pool_id).ok_or(EngineError::NotFound(*pool_id))?;
        write_within_timeout(shared, *pool_id).await
    }

    pub(super) async fn read_pool(
        &self,
        pool_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<PoolState>, EngineError> {
        let shared = self.get_pool(pool_id).ok_or(EngineError::NotFound(*pool_id))?;
        tokio::time::timeout(lock_timeout(), shared.read_owned())
            .await
            .map_err(|_| conflict(Some(*pool_id)))
    }

    /// Shared hold on the commit gate, bounded like the pool locks. Fails
    /// with `ConcurrencyConflict` while compaction keeps it exclusively.
    pub(super) async fn commit_shared(
        &self,
        pool_id: Option<Ulid>,
    ) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout(lock_timeout(), self.commit_gate.read())
            .await
            .map_err(|_| conflict(pool_id))
    }

    /// Every pool handle ordered by id, cloned out of the map so no shard
    /// lock is held across an await.
    pub(super) fn pool_handles(&self) -> Vec<(Ulid, SharedPoolState)> {
        let mut handles: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }
}

pub(super) async fn write_within_timeout(
    shared: SharedPoolState,
    pool_id: Ulid,
) -> Result<OwnedRwLockWriteGuard<PoolState>, EngineError> {
    tokio::time::timeout(lock_timeout(), shared.write_owned())
        .await
        .map_err(|_| conflict(Some(pool_id)))
}

fn lock_timeout() -> Duration {
    Duration::from_millis(LOCK_TIMEOUT_MS)
}

fn conflict(pool_id: Option<Ulid>) -> EngineError {
    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
    tracing::debug!(pool_id = ?pool_id, "lock timeout");
    EngineError::ConcurrencyConflict(pool_id)
}
