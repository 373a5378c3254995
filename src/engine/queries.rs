use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Slots ordered by date then window, optionally limited to one date.
    pub async fn list_slots(&self, date: Option<NaiveDate>) -> Vec<SlotInfo> {
        let mut out = Vec::new();
        for slot in self.slot_handles() {
            let guard = slot.read().await;
            if guard.retired || date.is_some_and(|d| d != guard.key.date) {
                continue;
            }
            out.push(guard.info());
        }
        out.sort_by(|a, b| (a.date, &a.time_window).cmp(&(b.date, &b.time_window)));
        out
    }

    pub async fn get_slot_info(&self, id: &Ulid) -> Result<SlotInfo, EngineError> {
        let slot = self.get_slot(id).ok_or(EngineError::NotFound(*id))?;
        let guard = slot.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard.info())
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<ReservationInfo, EngineError> {
        let slot_id = self.slot_for_reservation(id).ok_or(EngineError::NotFound(*id))?;
        let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound(*id))?;
        let guard = slot.read().await;
        guard
            .reservations
            .get(id)
            .map(|r| guard.reservation_info(r))
            .ok_or(EngineError::NotFound(*id))
    }

    /// Reservations in id (creation) order, optionally limited to one slot.
    pub async fn list_reservations(&self, slot_id: Option<Ulid>) -> Result<Vec<ReservationInfo>, EngineError> {
        let slots = match slot_id {
            Some(id) => vec![self.get_slot(&id).ok_or(EngineError::NotFound(id))?],
            None => self.slot_handles(),
        };
        let mut out = Vec::new();
        for slot in slots {
            let guard = slot.read().await;
            out.extend(guard.reservations.values().map(|r| guard.reservation_info(r)));
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }
}
