use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// A slot is addressed by its delivery date and time-window label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time_window: String,
}

impl SlotKey {
    pub fn new(date: NaiveDate, time_window: impl Into<String>) -> Self {
        Self {
            date,
            time_window: time_window.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    /// Statuses that account for one unit of the slot's reserved count.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Carrier choice attached to a reservation. `ship_date` is derived by the
/// calendar from `transit_days` when the hold is placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentPlan {
    pub carrier: Option<String>,
    pub service: String,
    pub rate_id: String,
    pub transit_days: u32,
    pub ship_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub status: ReservationStatus,
    pub expires_at: Ms,
    pub order_id: Option<String>,
    pub confirmed_at: Option<Ms>,
    pub shipment: Option<ShipmentPlan>,
}

impl Reservation {
    /// A hold whose expiry has passed but which the sweep has not yet recorded.
    pub fn is_lapsed(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub key: SlotKey,
    pub capacity: u32,
    /// Units held by `reserved` + `confirmed` reservations. Never exceeds `capacity`.
    pub reserved_count: u32,
    pub reservations: HashMap<Ulid, Reservation>,
    /// Set when the slot is deleted; waiters that still hold the Arc must bail.
    pub retired: bool,
}

impl SlotState {
    pub fn new(id: Ulid, key: SlotKey, capacity: u32) -> Self {
        Self {
            id,
            key,
            capacity,
            reserved_count: 0,
            reservations: HashMap::new(),
            retired: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.reserved_count)
    }

    pub fn is_full(&self) -> bool {
        self.reserved_count >= self.capacity
    }

    /// Recount units from reservation statuses. Used by tests and replay checks.
    pub fn counted_units(&self) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.status.holds_capacity())
            .count() as u32
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            date: self.key.date,
            time_window: self.key.time_window.clone(),
            capacity: self.capacity,
            reserved_count: self.reserved_count,
        }
    }

    pub fn reservation_info(&self, reservation: &Reservation) -> ReservationInfo {
        ReservationInfo {
            id: reservation.id,
            slot_id: self.id,
            delivery_date: self.key.date,
            time_window: self.key.time_window.clone(),
            status: reservation.status,
            expires_at: reservation.expires_at,
            order_id: reservation.order_id.clone(),
            confirmed_at: reservation.confirmed_at,
            shipment: reservation.shipment.clone(),
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        date: NaiveDate,
        time_window: String,
        capacity: u32,
    },
    SlotDeleted {
        id: Ulid,
    },
    ReservationPlaced {
        id: Ulid,
        slot_id: Ulid,
        expires_at: Ms,
        shipment: Option<ShipmentPlan>,
    },
    ReservationConfirmed {
        id: Ulid,
        slot_id: Ulid,
        order_id: String,
        confirmed_at: Ms,
    },
    ReservationReleased {
        id: Ulid,
        slot_id: Ulid,
    },
    ReservationExpired {
        id: Ulid,
        slot_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub date: NaiveDate,
    pub time_window: String,
    pub capacity: u32,
    pub reserved_count: u32,
}

/// Reservation as seen by callers. Carries everything an order mirrors at
/// confirmation time: slot id, delivery date, ship date and carrier choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub delivery_date: NaiveDate,
    pub time_window: String,
    pub status: ReservationStatus,
    pub expires_at: Ms,
    pub order_id: Option<String>,
    pub confirmed_at: Option<Ms>,
    pub shipment: Option<ShipmentPlan>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn reservation(slot_id: Ulid, status: ReservationStatus, expires_at: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            slot_id,
            status,
            expires_at,
            order_id: None,
            confirmed_at: None,
            shipment: None,
        }
    }

    #[test]
    fn status_capacity_attribution() {
        assert!(ReservationStatus::Reserved.holds_capacity());
        assert!(ReservationStatus::Confirmed.holds_capacity());
        assert!(!ReservationStatus::Released.holds_capacity());
        assert!(!ReservationStatus::Expired.holds_capacity());
    }

    #[test]
    fn only_reserved_is_non_terminal() {
        assert!(!ReservationStatus::Reserved.is_terminal());
        assert!(ReservationStatus::Confirmed.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }

    #[test]
    fn lapsed_requires_reserved_and_past_expiry() {
        let slot_id = Ulid::new();
        assert!(reservation(slot_id, ReservationStatus::Reserved, 1000).is_lapsed(1000));
        assert!(reservation(slot_id, ReservationStatus::Reserved, 999).is_lapsed(1000));
        assert!(!reservation(slot_id, ReservationStatus::Reserved, 1001).is_lapsed(1000));
        // Confirmed holds never lapse
        assert!(!reservation(slot_id, ReservationStatus::Confirmed, 0).is_lapsed(1000));
    }

    #[test]
    fn slot_remaining_and_full() {
        let mut slot = SlotState::new(Ulid::new(), SlotKey::new(date(2026, 2, 25), "AM"), 2);
        assert_eq!(slot.remaining(), 2);
        assert!(!slot.is_full());
        slot.reserved_count = 2;
        assert_eq!(slot.remaining(), 0);
        assert!(slot.is_full());
    }

    #[test]
    fn counted_units_ignores_terminal_releases() {
        let mut slot = SlotState::new(Ulid::new(), SlotKey::new(date(2026, 2, 25), "AM"), 5);
        for status in [
            ReservationStatus::Reserved,
            ReservationStatus::Confirmed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            let r = reservation(slot.id, status, 0);
            slot.reservations.insert(r.id, r);
        }
        assert_eq!(slot.counted_units(), 2);
    }

    #[test]
    fn reservation_info_carries_slot_date() {
        let slot = SlotState::new(Ulid::new(), SlotKey::new(date(2026, 2, 25), "PM"), 1);
        let r = reservation(slot.id, ReservationStatus::Reserved, 42);
        let info = slot.reservation_info(&r);
        assert_eq!(info.delivery_date, date(2026, 2, 25));
        assert_eq!(info.time_window, "PM");
        assert_eq!(info.slot_id, slot.id);
        assert_eq!(info.expires_at, 42);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationPlaced {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            expires_at: 1_700_000_000_000,
            shipment: Some(ShipmentPlan {
                carrier: Some("DPD".into()),
                service: "DPD UK Next Day".into(),
                rate_id: "rate_123".into(),
                transit_days: 1,
                ship_date: date(2026, 2, 24),
            }),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
