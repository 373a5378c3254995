mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;
pub use mutations::{ReserveRequest, ShippingSelection};
pub(crate) use validate::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::Calendar;
use crate::config::BookingConfig;
use crate::limits::MAX_RESERVATIONS_PER_SLOT;
use crate::model::*;
use crate::observability::{SLOTS_ACTIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// Every append already queued when the first one arrives rides the same
/// fsync. A non-append command ends the batch and runs after it is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
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
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't ride the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
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

/// In-memory slot store backed by the WAL.
///
/// Each slot sits behind its own `RwLock`; that lock is the single owner of
/// the slot's `reserved_count`. Every mutation holds the write guard across
/// check, WAL append and apply.
pub struct Engine {
    slots: DashMap<Ulid, SharedSlotState>,
    slot_keys: DashMap<SlotKey, Ulid>,
    /// Reverse lookup: reservation id → slot id
    reservation_to_slot: DashMap<Ulid, Ulid>,
    /// Serializes slot creation/deletion so `(date, window)` stays unique.
    create_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    calendar: Arc<Calendar>,
    booking: BookingConfig,
}

/// Apply a reservation event to its slot (no locking; caller holds the lock).
fn apply_to_slot(slot: &mut SlotState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationPlaced {
            id,
            slot_id,
            expires_at,
            shipment,
        } => {
            slot.reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    slot_id: *slot_id,
                    status: ReservationStatus::Reserved,
                    expires_at: *expires_at,
                    order_id: None,
                    confirmed_at: None,
                    shipment: shipment.clone(),
                },
            );
            slot.reserved_count = slot.reserved_count.saturating_add(1);
            index.insert(*id, *slot_id);
            prune_history(slot, index, MAX_RESERVATIONS_PER_SLOT);
        }
        Event::ReservationConfirmed {
            id,
            order_id,
            confirmed_at,
            ..
        } => {
            if let Some(r) = slot.reservations.get_mut(id)
                && r.status == ReservationStatus::Reserved
            {
                r.status = ReservationStatus::Confirmed;
                r.order_id = Some(order_id.clone());
                r.confirmed_at = Some(*confirmed_at);
            }
        }
        Event::ReservationReleased { id, .. } => {
            return_unit(slot, id, ReservationStatus::Released);
        }
        Event::ReservationExpired { id, .. } => {
            if slot
                .reservations
                .get(id)
                .is_some_and(|r| r.status == ReservationStatus::Reserved)
            {
                return_unit(slot, id, ReservationStatus::Expired);
            }
        }
        // SlotCreated/Deleted are handled at the DashMap level, not here
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => {}
    }
}

/// Once a slot's history passes `limit`, drop its oldest released or expired
/// reservations until a quarter of the room is free again. Live holds and
/// confirmations are never dropped. Runs on replay too, so both sides agree.
fn prune_history(slot: &mut SlotState, index: &DashMap<Ulid, Ulid>, limit: usize) {
    if slot.reservations.len() <= limit {
        return;
    }
    let target = limit - limit / 4;
    let mut finished: Vec<Ulid> = slot
        .reservations
        .values()
        .filter(|r| !r.status.holds_capacity())
        .map(|r| r.id)
        .collect();
    finished.sort_unstable();
    let excess = slot.reservations.len().saturating_sub(target);
    for id in finished.into_iter().take(excess) {
        slot.reservations.remove(&id);
        index.remove(&id);
    }
}

/// Move a capacity-holding reservation into a terminal status and give its unit back.
fn return_unit(slot: &mut SlotState, id: &Ulid, to: ReservationStatus) {
    if let Some(r) = slot.reservations.get_mut(id)
        && r.status.holds_capacity()
    {
        r.status = to;
        slot.reserved_count = slot.reserved_count.saturating_sub(1);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, calendar: Arc<Calendar>, booking: BookingConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_to_slot = DashMap::new();
        let mut replayed: HashMap<Ulid, SlotState> = HashMap::new();
        for event in &events {
            match event {
                Event::SlotCreated {
                    id,
                    date,
                    time_window,
                    capacity,
                } => {
                    let key = SlotKey::new(*date, time_window.clone());
                    replayed.insert(*id, SlotState::new(*id, key, *capacity));
                }
                Event::SlotDeleted { id } => {
                    if let Some(slot) = replayed.remove(id) {
                        for rid in slot.reservations.keys() {
                            reservation_to_slot.remove(rid);
                        }
                    }
                }
                other => {
                    if let Some(slot_id) = event_slot_id(other)
                        && let Some(slot) = replayed.get_mut(&slot_id)
                    {
                        apply_to_slot(slot, other, &reservation_to_slot);
                    }
                }
            }
        }

        let slots = DashMap::with_capacity(replayed.len());
        let slot_keys = DashMap::with_capacity(replayed.len());
        for (id, slot) in replayed {
            if slot.counted_units() != slot.reserved_count {
                warn!(slot = %id, "replayed count {} disagrees with statuses", slot.reserved_count);
            }
            slot_keys.insert(slot.key.clone(), id);
            slots.insert(id, Arc::new(RwLock::new(slot)));
        }
        metrics::gauge!(SLOTS_ACTIVE).set(slots.len() as f64);
        info!(
            "replayed {} events: {} slots, {} reservations",
            events.len(),
            slots.len(),
            reservation_to_slot.len()
        );

        Ok(Self {
            slots,
            slot_keys,
            reservation_to_slot,
            create_lock: Mutex::new(()),
            wal_tx,
            calendar,
            booking,
        })
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn booking(&self) -> BookingConfig {
        self.booking
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_slot.get(reservation_id).map(|e| *e.value())
    }

    fn slot_id_for_key(&self, key: &SlotKey) -> Option<Ulid> {
        self.slot_keys.get(key).map(|e| *e.value())
    }

    /// Snapshot of every slot handle, so no map shard is held across an await.
    fn slot_handles(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(&self, slot: &mut SlotState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(slot, event, &self.reservation_to_slot);
        Ok(())
    }

    /// Lookup reservation → slot, acquire the slot's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .slot_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = slot.write_owned().await;
        // The slot may have been deleted while we waited.
        if guard.retired || !guard.reservations.contains_key(reservation_id) {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok(guard)
    }
}

/// Slot id of a reservation event (None for slot create/delete).
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationPlaced { slot_id, .. }
        | Event::ReservationConfirmed { slot_id, .. }
        | Event::ReservationReleased { slot_id, .. }
        | Event::ReservationExpired { slot_id, .. } => Some(*slot_id),
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => None,
    }
}
