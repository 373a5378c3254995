use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::limits::MAX_TRANSIT_DAYS;
use crate::model::Ms;

use super::Calendar;

/// A raw carrier rate as delivered by the shipping API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(alias = "service_type")]
    pub service: String,
    #[serde(default, alias = "delivery_days")]
    pub estimated_days: Option<u32>,
    /// Opaque to the calendar; carried through as the carrier formatted it.
    #[serde(deserialize_with = "price_text")]
    pub price: String,
    #[serde(alias = "id")]
    pub rate_id: String,
}

/// A quote that can make the requested delivery date, with the ship date it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifiedRate {
    #[serde(flatten)]
    pub quote: RateQuote,
    pub transit_days: u32,
    /// True when `transit_days` came from the service name, not the carrier.
    pub transit_inferred: bool,
    pub ship_date: NaiveDate,
}

fn price_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "price must be a number or string, got {other}"
        ))),
    }
}

impl Calendar {
    /// Keep the quotes whose transit time still makes `delivery_date`, in input order.
    ///
    /// Quotes without a transit estimate survive only if the service name reads
    /// as next-day; anything else cannot be verified and is dropped.
    pub fn qualifying_rates_for_delivery_date(
        &self,
        rates: &[RateQuote],
        delivery_date: NaiveDate,
        now: Ms,
    ) -> Vec<QualifiedRate> {
        rates
            .iter()
            .filter_map(|quote| self.qualify(quote, delivery_date, now))
            .collect()
    }

    fn qualify(&self, quote: &RateQuote, delivery_date: NaiveDate, now: Ms) -> Option<QualifiedRate> {
        let (transit_days, transit_inferred) = match quote.estimated_days {
            Some(days) => (days, false),
            None => match self.infer_transit_days(&quote.service) {
                Some(days) => (days, true),
                None => {
                    debug!(rate_id = %quote.rate_id, service = %quote.service, "dropping rate without transit estimate");
                    return None;
                }
            },
        };
        if transit_days > MAX_TRANSIT_DAYS {
            debug!(rate_id = %quote.rate_id, transit_days, "dropping rate with implausible transit");
            return None;
        }

        let Some(ship_date) = self.calculate_ship_date(delivery_date, transit_days, now) else {
            debug!(rate_id = %quote.rate_id, %delivery_date, transit_days, "dropping rate that cannot ship in time");
            return None;
        };

        Some(QualifiedRate {
            quote: quote.clone(),
            transit_days,
            transit_inferred,
            ship_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::tests::{date, london, uk_calendar};

    fn quote(service: &str, estimated_days: Option<u32>, rate_id: &str) -> RateQuote {
        RateQuote {
            carrier: None,
            service: service.into(),
            estimated_days,
            price: "4.99".into(),
            rate_id: rate_id.into(),
        }
    }

    #[test]
    fn next_day_name_without_estimate_is_kept() {
        let cal = uk_calendar();
        let rates = vec![quote("DPD UK Next Day", None, "r1")];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2026, 2, 25), london(2026, 2, 23, 10, 0));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].transit_days, 1);
        assert!(kept[0].transit_inferred);
        assert_eq!(kept[0].ship_date, date(2026, 2, 24));
        assert_eq!(kept[0].quote.rate_id, "r1");
    }

    #[test]
    fn unknown_name_without_estimate_is_dropped() {
        let cal = uk_calendar();
        let rates = vec![quote("Hermes Standard", None, "r1")];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2026, 2, 25), london(2026, 2, 23, 10, 0));
        assert!(kept.is_empty());
    }

    #[test]
    fn slow_rates_are_dropped() {
        let cal = uk_calendar();
        let now = london(2026, 2, 23, 10, 0);
        let rates = vec![
            quote("Economy", Some(5), "slow"),
            quote("Standard", Some(2), "ok"),
            quote("Tracked 48", Some(3), "too_late"),
        ];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2026, 2, 25), now);
        let ids: Vec<_> = kept.iter().map(|r| r.quote.rate_id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(kept[0].ship_date, date(2026, 2, 23));
        assert!(!kept[0].transit_inferred);
    }

    #[test]
    fn input_order_is_preserved() {
        let cal = uk_calendar();
        let rates = vec![
            quote("Zeta express", None, "c"),
            quote("Alpha", Some(1), "a"),
            quote("Unknown", None, "dropped"),
            quote("Beta", Some(0), "b"),
        ];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2026, 2, 25), london(2026, 2, 23, 10, 0));
        let ids: Vec<_> = kept.iter().map(|r| r.quote.rate_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn after_cutoff_same_day_ship_is_dropped() {
        let cal = uk_calendar();
        let rates = vec![quote("DPD Next Day", Some(1), "r1")];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2026, 2, 24), london(2026, 2, 23, 17, 0));
        assert!(kept.is_empty());
    }

    #[test]
    fn implausible_transit_is_dropped() {
        let cal = uk_calendar();
        let rates = vec![quote("Sea freight", Some(MAX_TRANSIT_DAYS + 1), "r1")];
        let kept = cal.qualifying_rates_for_delivery_date(&rates, date(2027, 2, 25), london(2026, 2, 23, 10, 0));
        assert!(kept.is_empty());
    }

    #[test]
    fn quotes_parse_from_carrier_json() {
        let json = r#"[
            {"carrier": "DPD", "service": "DPD UK Next Day", "estimated_days": null, "price": 6.5, "rate_id": "se-1"},
            {"service_type": "Royal Mail Tracked 48", "delivery_days": 2, "price": "3.20", "id": "se-2"}
        ]"#;
        let quotes: Vec<RateQuote> = serde_json::from_str(json).unwrap();
        assert_eq!(quotes[0].carrier.as_deref(), Some("DPD"));
        assert_eq!(quotes[0].estimated_days, None);
        assert_eq!(quotes[0].price, "6.5");
        assert_eq!(quotes[1].service, "Royal Mail Tracked 48");
        assert_eq!(quotes[1].estimated_days, Some(2));
        assert_eq!(quotes[1].price, "3.20");
        assert_eq!(quotes[1].rate_id, "se-2");
    }

    #[test]
    fn price_must_be_scalar() {
        let json = r#"{"service": "X", "price": {"amount": 1}, "rate_id": "r"}"#;
        assert!(serde_json::from_str::<RateQuote>(json).is_err());
    }
}
