//! Hourly forecast cache, tier policy, and the weekly model-validity window.
//!
//! Exactly one forecast entry is live at a time; it expires at the top of the
//! next hour and is persisted so a restart does not re-forecast immediately.

use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::TierBracket;
use crate::error::{ControlError, Result};
use crate::fsio::write_atomic;

/// The single live forecast
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForecastEntry {
    /// Predicted requests for the next hour
    pub requests: u64,
    pub valid_until: DateTime<Local>,
}

/// Truncate to the top of the hour containing `t`.
pub fn hour_floor(t: DateTime<Local>) -> DateTime<Local> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// A forecast written at hh:mm is valid until (hh+1):00.
pub fn forecast_expiry(now: DateTime<Local>) -> DateTime<Local> {
    hour_floor(now + Duration::hours(1))
}

/// Persisted forecast entry
#[derive(Debug)]
pub struct ForecastCache {
    path: PathBuf,
    entry: Option<ForecastEntry>,
}

impl ForecastCache {
    /// Load the persisted entry, discarding it if already expired.
    pub fn load(path: PathBuf) -> Self {
        let entry = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ForecastEntry>(&bytes) {
                Ok(entry) if entry.valid_until > Local::now() => {
                    info!(
                        requests = entry.requests,
                        valid_until = %entry.valid_until,
                        "Loaded valid forecast from cache"
                    );
                    Some(entry)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Forecast cache unreadable, ignoring");
                    None
                }
            },
            Err(_) => None,
        };

        Self { path, entry }
    }

    /// The live entry, if `now` is before its expiry
    pub fn current(&self, now: DateTime<Local>) -> Option<ForecastEntry> {
        self.entry.filter(|e| now < e.valid_until)
    }

    /// The most recent entry regardless of expiry (degraded operation after
    /// a forecast failure)
    pub fn last(&self) -> Option<ForecastEntry> {
        self.entry
    }

    /// Record a fresh prediction, valid until the top of the next hour. The
    /// in-memory entry is set even when persistence fails; a restart would
    /// merely re-forecast.
    pub fn store(&mut self, requests: u64, now: DateTime<Local>) -> Result<ForecastEntry> {
        let entry = ForecastEntry {
            requests,
            valid_until: forecast_expiry(now),
        };
        self.entry = Some(entry);
        let bytes = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&self.path, &bytes)?;
        Ok(entry)
    }
}

/// Ordered request-per-hour brackets -> required server count
#[derive(Debug, Clone)]
pub struct TierPolicy {
    brackets: Vec<TierBracket>,
}

impl TierPolicy {
    pub fn new(brackets: Vec<TierBracket>) -> Result<Self> {
        if brackets.is_empty() {
            return Err(ControlError::Config("empty tier policy".to_string()));
        }
        for pair in brackets.windows(2) {
            if pair[1].upto <= pair[0].upto || pair[1].servers < pair[0].servers {
                return Err(ControlError::Config(
                    "tier policy must be ascending with non-decreasing counts".to_string(),
                ));
            }
        }
        Ok(Self { brackets })
    }

    /// Servers required for a predicted hourly request volume. Traffic beyond
    /// the last bracket clamps to the last count.
    pub fn required_servers(&self, requests: u64) -> usize {
        for bracket in &self.brackets {
            if requests < bracket.upto {
                return bracket.servers;
            }
        }
        self.brackets.last().map(|b| b.servers).unwrap_or(1)
    }
}

/// Accuracy metrics published with retraining events, opaque to the core
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub r2: f64,
    pub smape: f64,
    pub accuracy: f64,
}

/// Weekly validity window of a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelValidity {
    pub valid_from: DateTime<Local>,
    pub valid_to: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<ModelMetrics>,
}

impl ModelValidity {
    pub fn contains(&self, now: DateTime<Local>) -> bool {
        now >= self.valid_from && now <= self.valid_to
    }
}

/// The retraining unit: Monday 00:00 to Sunday 23:59:59 of the week holding
/// `now`.
pub fn week_range(now: DateTime<Local>) -> (DateTime<Local>, DateTime<Local>) {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    let day_start = now
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let monday = day_start - Duration::days(days_from_monday);
    let sunday_end = monday + Duration::days(7) - Duration::seconds(1);
    (monday, sunday_end)
}

/// One measured hour of traffic, appended before each new forecast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub hour_start: DateTime<Local>,
    pub requests: u64,
}

/// Append-only hourly traffic history feeding model retraining
#[derive(Debug)]
pub struct TrafficHistory {
    path: PathBuf,
}

impl TrafficHistory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, hour_start: DateTime<Local>, requests: u64) -> Result<()> {
        let mut records: Vec<TrafficRecord> = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        // Re-running the gate within the same hour overwrites, not duplicates.
        records.retain(|r| r.hour_start != hour_start);
        records.push(TrafficRecord {
            hour_start,
            requests,
        });
        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    pub fn records(&self) -> Vec<TrafficRecord> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn tier_policy() -> TierPolicy {
        TierPolicy::new(vec![
            TierBracket {
                upto: 140_000,
                servers: 1,
            },
            TierBracket {
                upto: 420_000,
                servers: 2,
            },
            TierBracket {
                upto: 1_000_000,
                servers: 3,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_forecast_written_mid_hour_expires_at_next_hour() {
        let at = Local.with_ymd_and_hms(2025, 3, 10, 14, 17, 42).unwrap();
        let expiry = forecast_expiry(at);
        assert_eq!(
            expiry,
            Local.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_tier_policy_brackets() {
        let policy = tier_policy();
        assert_eq!(policy.required_servers(0), 1);
        assert_eq!(policy.required_servers(139_999), 1);
        assert_eq!(policy.required_servers(140_000), 2);
        assert_eq!(policy.required_servers(250_000), 2);
        assert_eq!(policy.required_servers(419_999), 2);
        assert_eq!(policy.required_servers(420_000), 3);
        // Beyond the last bracket clamps to the largest count.
        assert_eq!(policy.required_servers(5_000_000), 3);
    }

    #[test]
    fn test_tier_policy_rejects_non_monotone_tables() {
        assert!(TierPolicy::new(vec![
            TierBracket {
                upto: 100,
                servers: 2
            },
            TierBracket {
                upto: 200,
                servers: 1
            },
        ])
        .is_err());
    }

    #[test]
    fn test_cache_round_trip_and_expiry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forecast_cache.json");

        let now = Local::now();
        {
            let mut cache = ForecastCache::load(path.clone());
            assert!(cache.current(now).is_none());
            cache.store(250_000, now).unwrap();
            assert_eq!(cache.current(now).unwrap().requests, 250_000);
        }

        let reloaded = ForecastCache::load(path);
        // Validity depends on how close to the hour boundary we run; the
        // entry must either still be live or absent, never stale-but-live.
        if let Some(entry) = reloaded.current(Local::now()) {
            assert_eq!(entry.requests, 250_000);
            assert!(entry.valid_until > Local::now());
        }
    }

    #[test]
    fn test_week_range_spans_monday_to_sunday() {
        // 2025-03-12 is a Wednesday.
        let wednesday = Local.with_ymd_and_hms(2025, 3, 12, 15, 30, 0).unwrap();
        let (from, to) = week_range(wednesday);
        assert_eq!(from, Local.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        assert_eq!(
            to,
            Local.with_ymd_and_hms(2025, 3, 16, 23, 59, 59).unwrap()
        );

        let validity = ModelValidity {
            valid_from: from,
            valid_to: to,
            last_metrics: None,
        };
        assert!(validity.contains(wednesday));
        assert!(!validity.contains(to + Duration::seconds(1)));
    }

    #[test]
    fn test_traffic_history_overwrites_same_hour() {
        let dir = tempdir().unwrap();
        let history = TrafficHistory::new(dir.path().join("traffic_history.json"));

        let hour = hour_floor(Local::now());
        history.append(hour, 1_000).unwrap();
        history.append(hour, 1_200).unwrap();
        history.append(hour - Duration::hours(1), 900).unwrap();

        let records = history.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.requests == 1_200));
        assert!(!records.iter().any(|r| r.requests == 1_000));
    }
}
