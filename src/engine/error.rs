use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    /// The calendar does not offer this date (Sunday, holiday, or too soon).
    InvalidDate(NaiveDate),
    CapacityExhausted {
        slot_id: Ulid,
        capacity: u32,
    },
    NotFound(Ulid),
    AlreadyFinalized {
        id: Ulid,
        status: ReservationStatus,
    },
    /// The hold ran out before confirmation; the sweep reclaims its unit.
    Expired(Ulid),
    ImpossibleShipDate {
        delivery_date: NaiveDate,
        service: String,
    },
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDate(date) => {
                write!(f, "{date} is not a selectable delivery date")
            }
            EngineError::CapacityExhausted { slot_id, capacity } => {
                write!(f, "slot {slot_id} is full: all {capacity} places taken")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyFinalized { id, status } => {
                write!(f, "reservation {id} is already {status}")
            }
            EngineError::Expired(id) => write!(f, "reservation {id} hold has expired"),
            EngineError::ImpossibleShipDate {
                delivery_date,
                service,
            } => {
                write!(f, "{service} cannot deliver by {delivery_date}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
