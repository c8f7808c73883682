use crate::models::TrainingEvent;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Daily training load with the contributing sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLoad {
    /// Calendar day (UTC)
    pub date: NaiveDate,

    /// Total volume for the day (sum of all events)
    pub total_volume: Decimal,

    /// Number of exercises logged on this day
    pub event_count: u16,

    /// Individual event volumes for detailed analysis
    pub event_volumes: Vec<Decimal>,
}

/// Acute:chronic workload window evaluated at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadWindow {
    pub as_of: DateTime<Utc>,

    /// Sum of volume over the trailing acute window
    pub acute: Decimal,

    /// Weekly-equivalent average of volume over the chronic window
    pub chronic: Decimal,

    /// acute / chronic; `None` while history is too short to be meaningful
    pub ratio: Option<Decimal>,

    pub zone: RiskZone,
}

/// ACWR configuration with customizable windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcwrConfig {
    /// Acute window in days (default: 7)
    pub acute_days: u16,

    /// Chronic window in days (default: 28)
    pub chronic_days: u16,

    /// Minimum days of history before a ratio is reported
    pub min_history_days: u16,

    /// Chronic loads at or below this floor are treated as empty
    pub chronic_floor: Decimal,
}

impl Default for AcwrConfig {
    fn default() -> Self {
        AcwrConfig {
            acute_days: 7,
            chronic_days: 28,
            min_history_days: 14,
            chronic_floor: Decimal::new(1, 6),
        }
    }
}

/// Injury-risk zone derived from the workload ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskZone {
    #[serde(rename = "insufficient_data")]
    InsufficientData,
    #[serde(rename = "undertraining")]
    Undertraining,
    #[serde(rename = "optimal")]
    Optimal,
    #[serde(rename = "caution")]
    Caution,
    #[serde(rename = "high-risk")]
    HighRisk,
}

impl RiskZone {
    /// Classify a ratio; lower bounds are inclusive
    pub fn from_ratio(ratio: Decimal) -> Self {
        if ratio >= Decimal::new(15, 1) {
            RiskZone::HighRisk
        } else if ratio >= Decimal::new(13, 1) {
            RiskZone::Caution
        } else if ratio >= Decimal::new(8, 1) {
            RiskZone::Optimal
        } else {
            RiskZone::Undertraining
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskZone::InsufficientData => "insufficient_data",
            RiskZone::Undertraining => "undertraining",
            RiskZone::Optimal => "optimal",
            RiskZone::Caution => "caution",
            RiskZone::HighRisk => "high-risk",
        }
    }

    /// Ordering by severity, used when escalating a zone
    pub fn severity(&self) -> u8 {
        match self {
            RiskZone::InsufficientData => 0,
            RiskZone::Optimal => 1,
            RiskZone::Undertraining => 2,
            RiskZone::Caution => 3,
            RiskZone::HighRisk => 4,
        }
    }
}

impl fmt::Display for RiskZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Acute:chronic workload ratio engine
#[derive(Debug, Clone)]
pub struct AcwrCalculator {
    config: AcwrConfig,
}

impl AcwrCalculator {
    /// Create new ACWR calculator with default configuration
    pub fn new() -> Self {
        AcwrCalculator {
            config: AcwrConfig::default(),
        }
    }

    /// Create new ACWR calculator with custom configuration
    pub fn with_config(config: AcwrConfig) -> Self {
        AcwrCalculator { config }
    }

    pub fn config(&self) -> &AcwrConfig {
        &self.config
    }

    /// Aggregate daily volume from a collection of events
    pub fn aggregate_daily_loads(&self, events: &[TrainingEvent]) -> BTreeMap<NaiveDate, DailyLoad> {
        let mut daily: BTreeMap<NaiveDate, DailyLoad> = BTreeMap::new();

        for event in events {
            let date = event.timestamp.date_naive();
            let volume = event.volume();

            daily
                .entry(date)
                .and_modify(|day| {
                    day.total_volume = day.total_volume.saturating_add(volume);
                    day.event_count = day.event_count.saturating_add(1);
                    day.event_volumes.push(volume);
                })
                .or_insert(DailyLoad {
                    date,
                    total_volume: volume,
                    event_count: 1,
                    event_volumes: vec![volume],
                });
        }

        daily
    }

    /// Compute acute and chronic load plus the risk zone at `as_of`
    ///
    /// Windows are closed on both ends: an event exactly seven days old
    /// still counts toward the acute load. Events after `as_of` are ignored.
    pub fn compute_acwr(&self, events: &[TrainingEvent], as_of: DateTime<Utc>) -> WorkloadWindow {
        self.compute_acwr_with_origin(events, as_of, None)
    }

    /// Same as [`compute_acwr`](Self::compute_acwr) for a slice that may not
    /// reach back to the user's first event
    ///
    /// `history_start` is the user's first-ever event, when known; it counts
    /// toward the minimum-history rule even though its volume lies outside
    /// the windows.
    pub fn compute_acwr_with_origin(
        &self,
        events: &[TrainingEvent],
        as_of: DateTime<Utc>,
        history_start: Option<DateTime<Utc>>,
    ) -> WorkloadWindow {
        let acute_start = as_of - Duration::days(self.config.acute_days as i64);
        let chronic_start = as_of - Duration::days(self.config.chronic_days as i64);

        let mut acute = Decimal::ZERO;
        let mut chronic_total = Decimal::ZERO;
        let mut earliest: Option<DateTime<Utc>> = history_start.filter(|t| *t <= as_of);

        for event in events.iter().filter(|e| e.timestamp <= as_of) {
            earliest = Some(earliest.map_or(event.timestamp, |t| t.min(event.timestamp)));

            let volume = event.volume();
            if event.timestamp >= acute_start {
                acute = acute.saturating_add(volume);
            }
            if event.timestamp >= chronic_start {
                chronic_total = chronic_total.saturating_add(volume);
            }
        }

        let weeks = Decimal::from(self.config.chronic_days) / Decimal::from(7);
        let chronic = chronic_total / weeks;

        let history_days = earliest.map(|t| as_of - t);
        let enough_history = history_days
            .map(|d| d >= Duration::days(self.config.min_history_days as i64))
            .unwrap_or(false);

        let (ratio, zone) = if !enough_history || chronic <= self.config.chronic_floor {
            (None, RiskZone::InsufficientData)
        } else {
            let ratio = acute.checked_div(chronic).unwrap_or(Decimal::MAX);
            (Some(ratio), RiskZone::from_ratio(ratio))
        };

        debug!(
            %as_of,
            acute = %acute,
            chronic = %chronic,
            ratio = ?ratio.map(|r| r.round_dp(3)),
            zone = %zone,
            "computed workload window"
        );

        WorkloadWindow {
            as_of,
            acute,
            chronic,
            ratio,
            zone,
        }
    }

    /// One workload window per calendar day, evaluated at the end of each day
    pub fn acwr_series(
        &self,
        events: &[TrainingEvent],
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Vec<WorkloadWindow> {
        let mut series = Vec::new();
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);

        let mut current_date = start_date;
        while current_date <= end_date {
            let as_of = Utc.from_utc_datetime(&current_date.and_time(end_of_day));
            series.push(self.compute_acwr(events, as_of));

            current_date = match current_date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        series
    }

    /// Count days in the series whose ratio entered the high-risk zone
    pub fn spike_days(&self, series: &[WorkloadWindow]) -> usize {
        series.iter().filter(|w| w.zone == RiskZone::HighRisk).count()
    }

    /// Mean ratio over the days that had one
    pub fn mean_ratio(&self, series: &[WorkloadWindow]) -> Option<f64> {
        let ratios: Vec<f64> = series
            .iter()
            .filter_map(|w| w.ratio.and_then(|r| r.to_f64()))
            .collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }
}

impl Default for AcwrCalculator {
    fn default() -> Self {
        Self::new()
    }
}
