//! Business-day calendar: which delivery dates a customer may pick and when
//! goods must leave the warehouse to meet them.
//!
//! Every function here is pure. "Now" is passed in as Unix milliseconds and
//! converted to the configured timezone; all comparisons are by local calendar
//! date, and the time of day only matters for the cutoff check.

mod rates;

pub use rates::{QualifiedRate, RateQuote};

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::CalendarConfig;
use crate::model::Ms;

#[derive(Debug, Clone)]
pub struct Calendar {
    tz: Tz,
    cutoff_hour: u32,
    holidays: BTreeSet<NaiveDate>,
    /// Lowercased phrases that mark a service as next-day when the carrier
    /// omits a transit estimate.
    next_day_phrases: Vec<String>,
}

impl Calendar {
    pub fn new(config: &CalendarConfig) -> Self {
        Self {
            tz: config.timezone,
            cutoff_hour: config.cutoff_hour,
            holidays: config.holidays.iter().copied().collect(),
            next_day_phrases: config
                .next_day_phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn cutoff_hour(&self) -> u32 {
        self.cutoff_hour
    }

    /// Sundays and configured bank holidays carry no deliveries.
    pub fn is_delivery_day(&self, date: NaiveDate) -> bool {
        date.weekday() != Weekday::Sun && !self.holidays.contains(&date)
    }

    fn local(&self, now: Ms) -> DateTime<Tz> {
        Utc.timestamp_millis_opt(now)
            .single()
            .unwrap_or_default()
            .with_timezone(&self.tz)
    }

    /// Local calendar date of `now`, plus whether the daily cutoff has passed.
    fn local_day(&self, now: Ms) -> (NaiveDate, bool) {
        let local = self.local(now);
        (local.date_naive(), local.hour() >= self.cutoff_hour)
    }

    /// First delivery-capable date strictly after `date`.
    fn next_delivery_day_after(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date;
        while let Some(next) = d.succ_opt() {
            d = next;
            if self.is_delivery_day(d) {
                break;
            }
        }
        d
    }

    /// Last delivery-capable date strictly before `date`.
    fn prev_delivery_day_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut d = date;
        loop {
            d = d.pred_opt()?;
            if self.is_delivery_day(d) {
                return Some(d);
            }
        }
    }

    /// Earliest date a customer may choose for delivery at `now`.
    pub fn min_selectable_delivery_date(&self, now: Ms) -> NaiveDate {
        let (today, past_cutoff) = self.local_day(now);
        let start = if past_cutoff {
            today.succ_opt().unwrap_or(today)
        } else {
            today
        };
        self.next_delivery_day_after(start)
    }

    pub fn is_selectable_delivery_date(&self, date: NaiveDate, now: Ms) -> bool {
        self.is_delivery_day(date) && date >= self.min_selectable_delivery_date(now)
    }

    /// Walk back `transit_days` delivery-capable days from `delivery_date`.
    ///
    /// Returns `None` when the resulting ship date has already gone: it is
    /// before today, or it is today and the cutoff has passed.
    pub fn calculate_ship_date(
        &self,
        delivery_date: NaiveDate,
        transit_days: u32,
        now: Ms,
    ) -> Option<NaiveDate> {
        let mut ship = delivery_date;
        for _ in 0..transit_days {
            ship = self.prev_delivery_day_before(ship)?;
        }

        let (today, past_cutoff) = self.local_day(now);
        if ship < today || (ship == today && past_cutoff) {
            return None;
        }
        Some(ship)
    }

    /// `Some(1)` when the service name reads like a next-day product.
    pub fn infer_transit_days(&self, service: &str) -> Option<u32> {
        let name = service.to_lowercase();
        self.next_day_phrases
            .iter()
            .any(|phrase| name.contains(phrase.as_str()))
            .then_some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::London;

    pub(super) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Wall-clock time in London as Unix ms.
    pub(super) fn london(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        London
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    pub(super) fn uk_calendar() -> Calendar {
        Calendar::new(&CalendarConfig {
            timezone: London,
            cutoff_hour: 16,
            holidays: vec![date(2026, 5, 25)],
            next_day_phrases: CalendarConfig::default_next_day_phrases(),
        })
    }

    #[test]
    fn min_date_before_cutoff_is_tomorrow() {
        let cal = uk_calendar();
        // Monday 15:00
        assert_eq!(
            cal.min_selectable_delivery_date(london(2026, 2, 23, 15, 0)),
            date(2026, 2, 24)
        );
    }

    #[test]
    fn min_date_after_cutoff_skips_a_day() {
        let cal = uk_calendar();
        assert_eq!(
            cal.min_selectable_delivery_date(london(2026, 2, 23, 17, 0)),
            date(2026, 2, 25)
        );
    }

    #[test]
    fn min_date_exactly_at_cutoff_counts_as_after() {
        let cal = uk_calendar();
        assert_eq!(
            cal.min_selectable_delivery_date(london(2026, 2, 23, 16, 0)),
            date(2026, 2, 25)
        );
    }

    #[test]
    fn min_date_skips_sunday_and_bank_holiday() {
        let cal = uk_calendar();
        // Saturday before the late-May bank holiday: Sun 24 and Mon 25 are out.
        assert_eq!(
            cal.min_selectable_delivery_date(london(2026, 5, 23, 10, 0)),
            date(2026, 5, 26)
        );
    }

    #[test]
    fn min_date_uses_local_time_in_summer() {
        let cal = uk_calendar();
        // 15:30 UTC on a BST day is 16:30 in London: past the cutoff.
        let now = Utc
            .with_ymd_and_hms(2026, 6, 10, 15, 30, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        assert_eq!(cal.min_selectable_delivery_date(now), date(2026, 6, 12));
    }

    #[test]
    fn min_date_is_never_a_non_delivery_day() {
        let cal = uk_calendar();
        let start = london(2026, 5, 1, 0, 0);
        let hour = 3_600_000;
        for i in 0..(24 * 40) {
            let now = start + i * hour;
            let min = cal.min_selectable_delivery_date(now);
            assert_ne!(min.weekday(), Weekday::Sun, "at offset {i}h");
            assert_ne!(min, date(2026, 5, 25), "at offset {i}h");
            assert!(cal.is_selectable_delivery_date(min, now));
        }
    }

    #[test]
    fn dates_before_minimum_are_not_selectable() {
        let cal = uk_calendar();
        let now = london(2026, 2, 23, 17, 0);
        assert!(!cal.is_selectable_delivery_date(date(2026, 2, 22), now));
        assert!(!cal.is_selectable_delivery_date(date(2026, 2, 23), now));
        assert!(!cal.is_selectable_delivery_date(date(2026, 2, 24), now));
        assert!(cal.is_selectable_delivery_date(date(2026, 2, 25), now));
    }

    #[test]
    fn sundays_and_holidays_are_not_selectable() {
        let cal = uk_calendar();
        let now = london(2026, 2, 23, 10, 0);
        assert!(!cal.is_selectable_delivery_date(date(2026, 3, 1), now)); // Sunday
        assert!(!cal.is_selectable_delivery_date(date(2026, 5, 25), now));
        assert!(cal.is_selectable_delivery_date(date(2026, 5, 26), now));
        assert!(cal.is_selectable_delivery_date(date(2026, 2, 28), now)); // Saturday
    }

    #[test]
    fn ship_date_one_day_back() {
        let cal = uk_calendar();
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 25), 1, london(2026, 2, 23, 10, 0)),
            Some(date(2026, 2, 24))
        );
    }

    #[test]
    fn ship_date_today_after_cutoff_is_impossible() {
        let cal = uk_calendar();
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 24), 1, london(2026, 2, 23, 17, 0)),
            None
        );
    }

    #[test]
    fn ship_date_today_before_cutoff_is_fine() {
        let cal = uk_calendar();
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 24), 1, london(2026, 2, 23, 9, 0)),
            Some(date(2026, 2, 23))
        );
    }

    #[test]
    fn ship_date_in_the_past_is_impossible() {
        let cal = uk_calendar();
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 24), 3, london(2026, 2, 23, 9, 0)),
            None
        );
    }

    #[test]
    fn zero_transit_ships_on_delivery_day() {
        let cal = uk_calendar();
        let now = london(2026, 2, 23, 9, 0);
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 23), 0, now),
            Some(date(2026, 2, 23))
        );
        assert_eq!(
            cal.calculate_ship_date(date(2026, 2, 23), 0, london(2026, 2, 23, 16, 0)),
            None
        );
    }

    #[test]
    fn ship_date_walk_skips_sunday_and_holiday() {
        let cal = uk_calendar();
        // Tue 26 May, 1 day transit: back over Mon 25 (holiday) and Sun 24.
        assert_eq!(
            cal.calculate_ship_date(date(2026, 5, 26), 1, london(2026, 5, 20, 9, 0)),
            Some(date(2026, 5, 23))
        );
        // Two days: Sat 23 then Fri 22.
        assert_eq!(
            cal.calculate_ship_date(date(2026, 5, 26), 2, london(2026, 5, 20, 9, 0)),
            Some(date(2026, 5, 22))
        );
    }

    #[test]
    fn ship_date_is_monotonic_in_delivery_date() {
        let cal = uk_calendar();
        let now = london(2026, 1, 1, 9, 0);
        for transit in 0..5 {
            let mut previous: Option<NaiveDate> = None;
            let mut d = date(2026, 5, 1);
            while d <= date(2026, 6, 30) {
                let ship = cal.calculate_ship_date(d, transit, now).unwrap();
                if let Some(prev) = previous {
                    assert!(ship >= prev, "transit {transit}: {d} shipped {ship} < {prev}");
                }
                previous = Some(ship);
                d = d.succ_opt().unwrap();
            }
        }
    }

    #[test]
    fn infer_transit_from_service_name() {
        let cal = uk_calendar();
        assert_eq!(cal.infer_transit_days("DPD UK Next Day"), Some(1));
        assert_eq!(cal.infer_transit_days("Royal Mail EXPRESS 24"), Some(1));
        assert_eq!(cal.infer_transit_days("Parcelforce overnight"), Some(1));
        assert_eq!(cal.infer_transit_days("Standard Parcel"), None);
    }

    #[test]
    fn phrase_vocabulary_is_configurable() {
        let cal = Calendar::new(&CalendarConfig {
            timezone: London,
            cutoff_hour: 16,
            holidays: vec![],
            next_day_phrases: vec!["  Priority ".into(), "".into()],
        });
        assert_eq!(cal.infer_transit_days("UPS priority"), Some(1));
        assert_eq!(cal.infer_transit_days("DPD Next Day"), None);
    }
}
