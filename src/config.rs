use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::limits::MAX_SLOT_CAPACITY;

/// Calendar rules: where "today" is, when it ends, and which days carry no deliveries.
#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub timezone: Tz,
    /// Local hour (0-23) from which same-day dispatch is no longer offered.
    pub cutoff_hour: u32,
    pub holidays: Vec<NaiveDate>,
    pub next_day_phrases: Vec<String>,
}

impl CalendarConfig {
    pub fn default_next_day_phrases() -> Vec<String> {
        ["next day", "next-day", "nextday", "express", "overnight"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::London,
            cutoff_hour: 16,
            holidays: Vec::new(),
            next_day_phrases: Self::default_next_day_phrases(),
        }
    }
}

/// Defaults applied by the reservation engine when a request leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingConfig {
    /// Capacity of slots created on demand by a reservation.
    pub default_capacity: u32,
    pub default_hold: Duration,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            default_capacity: 10,
            default_hold: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub sweep_interval: Duration,
    pub calendar: CalendarConfig,
    pub booking: BookingConfig,
}

impl Config {
    /// Read `SLOTWISE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let cutoff_hour: u32 = parse_or(&get, "SLOTWISE_CUTOFF_HOUR", 16)?;
        if cutoff_hour > 23 {
            return Err(ConfigError::invalid("SLOTWISE_CUTOFF_HOUR", cutoff_hour, "must be 0-23"));
        }

        let timezone = match get("SLOTWISE_TIMEZONE") {
            Some(name) => Tz::from_str(name.trim())
                .map_err(|e| ConfigError::invalid("SLOTWISE_TIMEZONE", &name, e))?,
            None => chrono_tz::Europe::London,
        };

        let holidays = match get("SLOTWISE_HOLIDAYS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .map_err(|e| ConfigError::invalid("SLOTWISE_HOLIDAYS", s, e))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let next_day_phrases = match get("SLOTWISE_NEXT_DAY_PHRASES") {
            Some(list) => list
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            None => CalendarConfig::default_next_day_phrases(),
        };

        let default_capacity: u32 = parse_or(&get, "SLOTWISE_DEFAULT_CAPACITY", 10)?;
        if default_capacity == 0 {
            return Err(ConfigError::invalid("SLOTWISE_DEFAULT_CAPACITY", 0, "must be at least 1"));
        }
        if default_capacity > MAX_SLOT_CAPACITY {
            return Err(ConfigError::invalid(
                "SLOTWISE_DEFAULT_CAPACITY",
                default_capacity,
                "exceeds the per-slot capacity limit",
            ));
        }
        let hold_secs: u64 = parse_or(&get, "SLOTWISE_HOLD_SECONDS", 15 * 60)?;
        if hold_secs == 0 {
            return Err(ConfigError::invalid("SLOTWISE_HOLD_SECONDS", 0, "must be at least 1"));
        }
        let sweep_secs: u64 = parse_or(&get, "SLOTWISE_SWEEP_INTERVAL_SECS", 60)?;
        if sweep_secs == 0 {
            return Err(ConfigError::invalid("SLOTWISE_SWEEP_INTERVAL_SECS", 0, "must be at least 1"));
        }

        let tls_cert = get("SLOTWISE_TLS_CERT");
        let tls_key = get("SLOTWISE_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::invalid(
                "SLOTWISE_TLS_CERT",
                tls_cert.as_deref().unwrap_or(""),
                "SLOTWISE_TLS_CERT and SLOTWISE_TLS_KEY must be set together",
            ));
        }

        Ok(Self {
            bind: get("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "SLOTWISE_PORT", 5433)?,
            data_dir: PathBuf::from(get("SLOTWISE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTWISE_PASSWORD").unwrap_or_else(|| "slotwise".into()),
            max_connections: parse_or(&get, "SLOTWISE_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "SLOTWISE_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "SLOTWISE_METRICS_PORT")?,
            tls_cert,
            tls_key,
            sweep_interval: Duration::from_secs(sweep_secs),
            calendar: CalendarConfig {
                timezone,
                cutoff_hour,
                holidays,
                next_day_phrases,
            },
            booking: BookingConfig {
                default_capacity,
                default_hold: Duration::from_secs(hold_secs),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(key, &raw, e))
        })
        .transpose()
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "invalid {key}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.calendar.timezone, chrono_tz::Europe::London);
        assert_eq!(cfg.calendar.cutoff_hour, 16);
        assert!(cfg.calendar.holidays.is_empty());
        assert_eq!(cfg.calendar.next_day_phrases, CalendarConfig::default_next_day_phrases());
        assert_eq!(cfg.booking, BookingConfig::default());
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/slotwise.wal"));
    }

    #[test]
    fn calendar_settings_parsed() {
        let cfg = config_from(&[
            ("SLOTWISE_TIMEZONE", "Europe/Dublin"),
            ("SLOTWISE_CUTOFF_HOUR", "14"),
            ("SLOTWISE_HOLIDAYS", "2026-05-25, 2026-08-31,"),
            ("SLOTWISE_NEXT_DAY_PHRASES", "next day, 24h"),
        ])
        .unwrap();
        assert_eq!(cfg.calendar.timezone, chrono_tz::Europe::Dublin);
        assert_eq!(cfg.calendar.cutoff_hour, 14);
        assert_eq!(
            cfg.calendar.holidays,
            vec![
                NaiveDate::from_ymd_opt(2026, 5, 25).unwrap(),
                NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
            ]
        );
        assert_eq!(cfg.calendar.next_day_phrases, vec!["next day", "24h"]);
    }

    #[test]
    fn booking_settings_parsed() {
        let cfg = config_from(&[
            ("SLOTWISE_DEFAULT_CAPACITY", "3"),
            ("SLOTWISE_HOLD_SECONDS", "120"),
            ("SLOTWISE_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.booking.default_capacity, 3);
        assert_eq!(cfg.booking.default_hold, Duration::from_secs(120));
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config_from(&[("SLOTWISE_PORT", "  "), ("SLOTWISE_HOLIDAYS", "")]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert!(cfg.calendar.holidays.is_empty());
    }

    #[test]
    fn cutoff_out_of_range_rejected() {
        let err = config_from(&[("SLOTWISE_CUTOFF_HOUR", "24")]).unwrap_err();
        assert!(err.to_string().contains("SLOTWISE_CUTOFF_HOUR"));
    }

    #[test]
    fn unknown_timezone_rejected() {
        assert!(config_from(&[("SLOTWISE_TIMEZONE", "Mars/Olympus")]).is_err());
    }

    #[test]
    fn bad_holiday_rejected() {
        let err = config_from(&[("SLOTWISE_HOLIDAYS", "2026-05-25,25/12/2026")]).unwrap_err();
        assert!(err.to_string().contains("25/12/2026"));
    }

    #[test]
    fn zero_capacity_and_hold_rejected() {
        assert!(config_from(&[("SLOTWISE_DEFAULT_CAPACITY", "0")]).is_err());
        assert!(config_from(&[("SLOTWISE_HOLD_SECONDS", "0")]).is_err());
        assert!(config_from(&[("SLOTWISE_SWEEP_INTERVAL_SECS", "0")]).is_err());
    }

    #[test]
    fn capacity_above_slot_limit_rejected() {
        assert!(config_from(&[("SLOTWISE_DEFAULT_CAPACITY", "10001")]).is_err());
        let cfg = config_from(&[("SLOTWISE_DEFAULT_CAPACITY", "10000")]).unwrap();
        assert_eq!(cfg.booking.default_capacity, MAX_SLOT_CAPACITY);
    }

    #[test]
    fn tls_requires_both_halves() {
        assert!(config_from(&[("SLOTWISE_TLS_CERT", "cert.pem")]).is_err());
        let cfg = config_from(&[
            ("SLOTWISE_TLS_CERT", "cert.pem"),
            ("SLOTWISE_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(cfg.tls_cert.as_deref(), Some("cert.pem"));
    }
}
