use std::time::Duration;

use crate::limits::*;
use crate::model::Ms;

use super::mutations::ShippingSelection;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_time_window(time_window: &str) -> Result<(), EngineError> {
    if time_window.trim().is_empty() {
        return Err(EngineError::LimitExceeded("time window must not be empty"));
    }
    if time_window.len() > MAX_TIME_WINDOW_LEN {
        return Err(EngineError::LimitExceeded("time window too long"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::LimitExceeded("capacity must be at least 1"));
    }
    if capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

/// Resolve the requested hold against the default, in ms.
pub(crate) fn hold_ms(requested: Option<Duration>, default: Duration) -> Result<Ms, EngineError> {
    let hold = requested.unwrap_or(default).as_millis();
    if hold == 0 {
        return Err(EngineError::LimitExceeded("hold must be positive"));
    }
    if hold > MAX_HOLD_MS as u128 {
        return Err(EngineError::LimitExceeded("hold too long"));
    }
    Ok(hold as Ms)
}

pub(crate) fn validate_order_ref(order_id: &str) -> Result<(), EngineError> {
    if order_id.trim().is_empty() {
        return Err(EngineError::LimitExceeded("order reference required"));
    }
    if order_id.len() > MAX_ORDER_REF_LEN {
        return Err(EngineError::LimitExceeded("order reference too long"));
    }
    Ok(())
}

pub(crate) fn validate_shipping(selection: &ShippingSelection) -> Result<(), EngineError> {
    if selection.service.len() > MAX_SERVICE_NAME_LEN
        || selection.carrier.as_ref().is_some_and(|c| c.len() > MAX_SERVICE_NAME_LEN)
    {
        return Err(EngineError::LimitExceeded("shipping service name too long"));
    }
    if selection.rate_id.len() > MAX_RATE_ID_LEN {
        return Err(EngineError::LimitExceeded("rate id too long"));
    }
    Ok(())
}
