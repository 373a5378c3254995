use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    CONFIRMATIONS_TOTAL, RELEASES_TOTAL, RESERVATIONS_TOTAL, SLOTS_ACTIVE, SWEEP_EXPIRED_TOTAL,
};

use super::validate::{
    hold_ms, now_ms, validate_capacity, validate_order_ref, validate_shipping, validate_time_window,
};
use super::{Engine, EngineError, SharedSlotState, WalCommand};

/// Carrier choice the customer made at checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingSelection {
    pub carrier: Option<String>,
    pub service: String,
    pub rate_id: String,
    /// Carrier's own estimate. When absent the service name is consulted.
    pub transit_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub date: NaiveDate,
    pub time_window: String,
    /// Falls back to the configured default hold.
    pub hold: Option<Duration>,
    pub shipping: Option<ShippingSelection>,
}

impl ReserveRequest {
    pub fn new(id: Ulid, date: NaiveDate, time_window: impl Into<String>) -> Self {
        Self {
            id,
            date,
            time_window: time_window.into(),
            hold: None,
            shipping: None,
        }
    }
}

fn reserve_outcome(err: &EngineError) -> &'static str {
    match err {
        EngineError::CapacityExhausted { .. } => "capacity_exhausted",
        EngineError::InvalidDate(_) => "invalid_date",
        EngineError::ImpossibleShipDate { .. } => "impossible_ship_date",
        _ => "rejected",
    }
}

impl Engine {
    pub async fn create_slot(
        &self,
        id: Ulid,
        date: NaiveDate,
        time_window: String,
        capacity: u32,
    ) -> Result<SlotInfo, EngineError> {
        validate_time_window(&time_window)?;
        validate_capacity(capacity)?;

        let _creating = self.create_lock.lock().await;
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let key = SlotKey::new(date, time_window);
        if let Some(existing) = self.slot_id_for_key(&key) {
            return Err(EngineError::AlreadyExists(existing));
        }
        let slot = self.insert_slot(id, key, capacity).await?;
        let info = slot.read().await.info();
        Ok(info)
    }

    /// Persist and register a new slot. Caller holds `create_lock` and has
    /// checked both id and key are free.
    async fn insert_slot(&self, id: Ulid, key: SlotKey, capacity: u32) -> Result<SharedSlotState, EngineError> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        let event = Event::SlotCreated {
            id,
            date: key.date,
            time_window: key.time_window.clone(),
            capacity,
        };
        self.wal_append(&event).await?;

        let slot = Arc::new(RwLock::new(SlotState::new(id, key.clone(), capacity)));
        self.slots.insert(id, slot.clone());
        self.slot_keys.insert(key.clone(), id);
        metrics::gauge!(SLOTS_ACTIVE).set(self.slots.len() as f64);
        info!(slot = %id, date = %key.date, window = %key.time_window, capacity, "slot created");
        Ok(slot)
    }

    /// Remove a slot and every reservation in it. Returns how many reservations went with it.
    pub async fn delete_slot(&self, id: Ulid) -> Result<usize, EngineError> {
        let _creating = self.create_lock.lock().await;
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = slot.write().await;

        self.wal_append(&Event::SlotDeleted { id }).await?;
        for rid in guard.reservations.keys() {
            self.reservation_to_slot.remove(rid);
        }
        let cascaded = guard.reservations.len();
        guard.reservations.clear();
        guard.reserved_count = 0;
        guard.retired = true;
        self.slot_keys.remove(&guard.key);
        self.slots.remove(&id);
        metrics::gauge!(SLOTS_ACTIVE).set(self.slots.len() as f64);
        info!(slot = %id, cascaded, "slot deleted");
        Ok(cascaded)
    }

    /// The slot for `key`, created with the default capacity if this is its first booking.
    async fn slot_for_key(&self, key: &SlotKey) -> Result<(Ulid, SharedSlotState), EngineError> {
        if let Some(id) = self.slot_id_for_key(key)
            && let Some(slot) = self.get_slot(&id)
        {
            return Ok((id, slot));
        }
        let _creating = self.create_lock.lock().await;
        if let Some(id) = self.slot_id_for_key(key)
            && let Some(slot) = self.get_slot(&id)
        {
            return Ok((id, slot));
        }
        validate_capacity(self.booking.default_capacity)?;
        let id = Ulid::new();
        let slot = self
            .insert_slot(id, key.clone(), self.booking.default_capacity)
            .await?;
        Ok((id, slot))
    }

    pub async fn reserve(&self, request: ReserveRequest) -> Result<ReservationInfo, EngineError> {
        self.reserve_at(request, now_ms()).await
    }

    pub async fn reserve_at(&self, request: ReserveRequest, now: Ms) -> Result<ReservationInfo, EngineError> {
        let result = self.try_reserve(request, now).await;
        let outcome = match &result {
            Ok(_) => "placed",
            Err(e) => reserve_outcome(e),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_reserve(&self, request: ReserveRequest, now: Ms) -> Result<ReservationInfo, EngineError> {
        let ReserveRequest {
            id,
            date,
            time_window,
            hold,
            shipping,
        } = request;
        validate_time_window(&time_window)?;
        let hold_ms = hold_ms(hold, self.booking.default_hold)?;
        if let Some(selection) = &shipping {
            validate_shipping(selection)?;
        }

        if !self.calendar.is_selectable_delivery_date(date, now) {
            return Err(EngineError::InvalidDate(date));
        }
        let shipment = shipping
            .map(|selection| self.plan_shipment(selection, date, now))
            .transpose()?;
        if self.reservation_to_slot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let (slot_id, slot) = self.slot_for_key(&SlotKey::new(date, time_window)).await?;
        // Claim the id before locking the slot so a concurrent reserve of the
        // same id on another slot sees it taken.
        match self.reservation_to_slot.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(slot_id);
            }
        }

        let mut guard = slot.write().await;
        let placed = self
            .place_claimed(&mut guard, id, now.saturating_add(hold_ms), shipment)
            .await;
        if placed.is_err() {
            self.reservation_to_slot.remove(&id);
        }
        placed
    }

    /// Place a hold whose id is already claimed in the reservation index.
    async fn place_claimed(
        &self,
        slot: &mut SlotState,
        id: Ulid,
        expires_at: Ms,
        shipment: Option<ShipmentPlan>,
    ) -> Result<ReservationInfo, EngineError> {
        if slot.retired {
            return Err(EngineError::NotFound(slot.id));
        }
        if slot.is_full() {
            return Err(EngineError::CapacityExhausted {
                slot_id: slot.id,
                capacity: slot.capacity,
            });
        }

        let event = Event::ReservationPlaced {
            id,
            slot_id: slot.id,
            expires_at,
            shipment,
        };
        self.persist_and_apply(slot, &event).await?;
        debug!(reservation = %id, slot = %slot.id, remaining = slot.remaining(), "reserved");
        Ok(slot.reservation_info(&slot.reservations[&id]))
    }

    /// Resolve the ship date for a chosen rate, or fail if it cannot make `delivery_date`.
    fn plan_shipment(
        &self,
        selection: ShippingSelection,
        delivery_date: NaiveDate,
        now: Ms,
    ) -> Result<ShipmentPlan, EngineError> {
        let transit_days = selection
            .transit_days
            .or_else(|| self.calendar.infer_transit_days(&selection.service))
            .filter(|days| *days <= MAX_TRANSIT_DAYS);
        let planned = transit_days.and_then(|days| {
            self.calendar
                .calculate_ship_date(delivery_date, days, now)
                .map(|ship_date| (days, ship_date))
        });
        let Some((transit_days, ship_date)) = planned else {
            return Err(EngineError::ImpossibleShipDate {
                delivery_date,
                service: selection.service,
            });
        };
        Ok(ShipmentPlan {
            carrier: selection.carrier,
            service: selection.service,
            rate_id: selection.rate_id,
            transit_days,
            ship_date,
        })
    }

    pub async fn confirm(&self, id: Ulid, order_id: String) -> Result<ReservationInfo, EngineError> {
        self.confirm_at(id, order_id, now_ms()).await
    }

    /// `reserved` → `confirmed`. A hold past its expiry is refused even if the
    /// sweep has not reached it yet; its unit comes back through the sweep.
    pub async fn confirm_at(&self, id: Ulid, order_id: String, now: Ms) -> Result<ReservationInfo, EngineError> {
        validate_order_ref(&order_id)?;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let reservation = &guard.reservations[&id];
        if reservation.status != ReservationStatus::Reserved {
            return Err(EngineError::AlreadyFinalized {
                id,
                status: reservation.status,
            });
        }
        if reservation.expires_at <= now {
            return Err(EngineError::Expired(id));
        }

        let event = Event::ReservationConfirmed {
            id,
            slot_id: guard.id,
            order_id,
            confirmed_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(CONFIRMATIONS_TOTAL).increment(1);
        info!(reservation = %id, slot = %guard.id, "reservation confirmed");
        Ok(guard.reservation_info(&guard.reservations[&id]))
    }

    /// Give a reserved or confirmed unit back. Releasing a reservation that
    /// is already released or expired changes nothing and returns it as is.
    pub async fn release(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        if !guard.reservations[&id].status.holds_capacity() {
            return Ok(guard.reservation_info(&guard.reservations[&id]));
        }

        let event = Event::ReservationReleased { id, slot_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(RELEASES_TOTAL).increment(1);
        debug!(reservation = %id, slot = %guard.id, "reservation released");
        Ok(guard.reservation_info(&guard.reservations[&id]))
    }

    pub async fn release_expired_reservations(&self) -> Result<usize, EngineError> {
        self.release_expired_at(now_ms()).await
    }

    /// Expire every hold whose `expires_at` is at or before `now`.
    ///
    /// Candidates are gathered under read locks, then re-checked one by one
    /// under the slot's write lock, so a `confirm` or `release` that gets in
    /// first simply wins and the hold is skipped.
    pub async fn release_expired_at(&self, now: Ms) -> Result<usize, EngineError> {
        let mut expired = 0;
        for slot in self.slot_handles() {
            let lapsed: Vec<Ulid> = {
                let guard = slot.read().await;
                guard
                    .reservations
                    .values()
                    .filter(|r| r.is_lapsed(now))
                    .map(|r| r.id)
                    .collect()
            };
            if lapsed.is_empty() {
                continue;
            }

            let mut guard = slot.write().await;
            if guard.retired {
                continue;
            }
            for id in lapsed {
                if !guard.reservations.get(&id).is_some_and(|r| r.is_lapsed(now)) {
                    debug!(reservation = %id, "sweep skipped: no longer a lapsed hold");
                    continue;
                }
                let event = Event::ReservationExpired { id, slot_id: guard.id };
                if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                    metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(expired as u64);
                    return Err(e);
                }
                expired += 1;
            }
        }
        metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(expired as u64);
        Ok(expired)
    }

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    ///
    /// Holds the creation lock and a read lock on every slot until the new
    /// log is in place, so no append can land in the old file mid-swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _creating = self.create_lock.lock().await;
        let mut handles = self.slot_handles();
        let mut guards = Vec::with_capacity(handles.len());
        for slot in handles.drain(..) {
            guards.push(slot.read_owned().await);
        }
        guards.sort_by_key(|g| g.id);

        let mut events = Vec::new();
        for slot in guards.iter().filter(|g| !g.retired) {
            events.push(Event::SlotCreated {
                id: slot.id,
                date: slot.key.date,
                time_window: slot.key.time_window.clone(),
                capacity: slot.capacity,
            });
            let mut reservations: Vec<&Reservation> = slot.reservations.values().collect();
            reservations.sort_by_key(|r| r.id);
            for r in reservations {
                emit_reservation(r, &mut events);
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
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

/// Events that replay a reservation into its current status.
fn emit_reservation(r: &Reservation, events: &mut Vec<Event>) {
    events.push(Event::ReservationPlaced {
        id: r.id,
        slot_id: r.slot_id,
        expires_at: r.expires_at,
        shipment: r.shipment.clone(),
    });
    if let (Some(order_id), Some(confirmed_at)) = (&r.order_id, r.confirmed_at) {
        events.push(Event::ReservationConfirmed {
            id: r.id,
            slot_id: r.slot_id,
            order_id: order_id.clone(),
            confirmed_at,
        });
    }
    match r.status {
        ReservationStatus::Reserved | ReservationStatus::Confirmed => {}
        ReservationStatus::Released => events.push(Event::ReservationReleased {
            id: r.id,
            slot_id: r.slot_id,
        }),
        ReservationStatus::Expired => events.push(Event::ReservationExpired {
            id: r.id,
            slot_id: r.slot_id,
        }),
    }
}
