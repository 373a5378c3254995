//! Hard bounds on client input. Anything beyond these is rejected with
//! `EngineError::LimitExceeded` (or a SQL parse error) before touching state.

use crate::model::Ms;

pub const MAX_SLOTS: usize = 100_000;
/// Reservation history kept per slot; older released/expired entries are pruned.
pub const MAX_RESERVATIONS_PER_SLOT: usize = 50_000;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;
pub const MAX_TIME_WINDOW_LEN: usize = 64;
pub const MAX_ORDER_REF_LEN: usize = 128;
pub const MAX_SERVICE_NAME_LEN: usize = 256;
pub const MAX_RATE_ID_LEN: usize = 256;

/// Longest hold a caller may request (24h).
pub const MAX_HOLD_MS: Ms = 24 * 3_600_000;

/// Transit estimates above this are treated as bogus carrier data.
pub const MAX_TRANSIT_DAYS: u32 = 60;

pub const MAX_RATES_PER_QUERY: usize = 500;
pub const MAX_RATES_JSON_LEN: usize = 1 << 20;
