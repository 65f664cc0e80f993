use std::path::PathBuf;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::engine::{AssignmentPolicy, EngineError};
use crate::limits::MIN_SLOT_CADENCE;
use crate::model::{Minute, ReservationStatus, parse_time};

/// Opening hours shared by every professional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessHours {
    pub open: Minute,
    pub close: Minute,
    /// Minutes between candidate start times.
    pub cadence: Minute,
    pub closed_days: Vec<Weekday>,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: 9 * 60,
            close: 18 * 60,
            cadence: 30,
            closed_days: Vec::new(),
        }
    }
}

impl BusinessHours {
    pub fn is_closed(&self, date: NaiveDate) -> bool {
        self.closed_days.contains(&date.weekday())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub hours: BusinessHours,
    /// Status a fresh booking commits with: pending or confirmed.
    pub default_status: ReservationStatus,
    pub assignment_policy: AssignmentPolicy,
    /// A stashed guest booking older than this is discarded instead of replayed.
    pub stash_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hours: BusinessHours::default(),
            default_status: ReservationStatus::Pending,
            assignment_policy: AssignmentPolicy::FirstQualified,
            stash_ttl: Duration::from_secs(86_400),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Some(open) = lookup("SALON_OPEN") {
            config.hours.open = parse_time(&open)?;
        }
        if let Some(close) = lookup("SALON_CLOSE") {
            config.hours.close = parse_time(&close)?;
        }
        if config.hours.open >= config.hours.close {
            return Err(EngineError::Format("SALON_OPEN must be before SALON_CLOSE".into()));
        }
        if let Some(cadence) = lookup("SALON_SLOT_CADENCE_MIN") {
            config.hours.cadence = cadence
                .trim()
                .parse()
                .map_err(|_| EngineError::Format(format!("bad SALON_SLOT_CADENCE_MIN: {cadence:?}")))?;
            if config.hours.cadence < MIN_SLOT_CADENCE {
                return Err(EngineError::LimitExceeded("slot cadence too small"));
            }
        }
        if let Some(days) = lookup("SALON_CLOSED_DAYS") {
            config.hours.closed_days = days
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| {
                    d.parse::<Weekday>()
                        .map_err(|_| EngineError::Format(format!("bad weekday in SALON_CLOSED_DAYS: {d:?}")))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(status) = lookup("SALON_DEFAULT_STATUS") {
            let status: ReservationStatus = status.parse()?;
            if !matches!(status, ReservationStatus::Pending | ReservationStatus::Confirmed) {
                return Err(EngineError::Format(format!(
                    "SALON_DEFAULT_STATUS must be pending or confirmed, got {status}"
                )));
            }
            config.default_status = status;
        }
        if let Some(policy) = lookup("SALON_ASSIGNMENT_POLICY") {
            config.assignment_policy = policy.parse()?;
        }
        if let Some(ttl) = lookup("SALON_STASH_TTL_SECS") {
            let secs: u64 = ttl
                .trim()
                .parse()
                .map_err(|_| EngineError::Format(format!("bad SALON_STASH_TTL_SECS: {ttl:?}")))?;
            config.stash_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Process-level settings for the `salon-engine` binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    pub seed_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Self {
            engine: EngineConfig::from_env()?,
            data_dir: std::env::var("SALON_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            seed_path: std::env::var("SALON_SEED").ok().map(PathBuf::from),
            metrics_port: std::env::var("SALON_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.hours.open, 540);
        assert_eq!(config.hours.close, 1080);
    }

    #[test]
    fn overrides_apply() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SALON_OPEN", "8:30"),
            ("SALON_CLOSE", "20:00:00"),
            ("SALON_SLOT_CADENCE_MIN", "15"),
            ("SALON_CLOSED_DAYS", "sun, Mon"),
            ("SALON_DEFAULT_STATUS", "confirmed"),
            ("SALON_ASSIGNMENT_POLICY", "least_loaded"),
            ("SALON_STASH_TTL_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.hours.open, 510);
        assert_eq!(config.hours.close, 1200);
        assert_eq!(config.hours.cadence, 15);
        assert_eq!(config.hours.closed_days, vec![Weekday::Sun, Weekday::Mon]);
        assert_eq!(config.default_status, ReservationStatus::Confirmed);
        assert_eq!(config.assignment_policy, AssignmentPolicy::LeastLoaded);
        assert_eq!(config.stash_ttl, Duration::from_secs(600));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_lookup(lookup(&[("SALON_OPEN", "9am")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("SALON_OPEN", "18:00"), ("SALON_CLOSE", "09:00")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("SALON_SLOT_CADENCE_MIN", "1")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("SALON_CLOSED_DAYS", "someday")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("SALON_DEFAULT_STATUS", "completed")])).is_err());
    }

    #[test]
    fn closed_weekday() {
        let hours = BusinessHours {
            closed_days: vec![Weekday::Sun],
            ..BusinessHours::default()
        };
        // 2025-03-09 is a Sunday
        assert!(hours.is_closed(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()));
        assert!(!hours.is_closed(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()));
    }
}
