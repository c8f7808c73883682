//! Per-muscle fatigue and recovery tracking
//!
//! Each training event deposits fatigue on every primary muscle it loads.
//! That fatigue then decays exponentially with a time constant derived from
//! the user's calibrated recovery hours for the muscle's body region.
//!
//! # Physiology Background
//!
//! - **Upper body** muscles recover faster (population default 48 h from full fatigue)
//! - **Lower body** muscles recover slower (population default 72 h)
//! - **Stacking**: fatigue from separate sessions adds up; a heavy session
//!   two days ago can still dominate a light session this morning
//!
//! # Model
//!
//! ```text
//! remaining(t) = Σ a_i · e^(−(t − t_i) / τ)
//! τ = recovery_hours / ln(100 / threshold)
//! ```
//!
//! so a fully fatigued muscle (100) reaches the recovery threshold exactly
//! after the calibrated recovery hours.

use crate::models::{MuscleCategory, MuscleGroup, RecoveryParameters, TrainingEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Coarse three-bucket recovery classification for display layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Fatigue low enough to train the muscle hard
    Ready,
    /// Trainable at reduced load
    PartiallyRecovered,
    /// Muscle should not be loaded hard yet
    NotReady,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Ready => "ready",
            RecoveryStatus::PartiallyRecovered => "partially_recovered",
            RecoveryStatus::NotReady => "not_ready",
        }
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStatus::Ready => write!(f, "Ready"),
            RecoveryStatus::PartiallyRecovered => write!(f, "Partially Recovered"),
            RecoveryStatus::NotReady => write!(f, "Not Ready"),
        }
    }
}

/// Fatigue deposit and classification constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuscleRecoveryConfig {
    /// Fatigue deposited per working set at RPE 10
    pub fatigue_per_set: f64,

    /// Cap on the fatigue a single event can deposit
    pub max_event_fatigue: f64,

    /// Multiplier for eccentric-emphasis work
    pub eccentric_factor: f64,

    /// RPE assumed for unrated sets
    pub unrated_rpe: f64,

    /// Fatigue level regarded as fully recovered
    pub full_recovery_threshold: f64,

    /// Levels below this read as ready
    pub ready_below: f64,

    /// Levels at or above this read as not ready
    pub not_ready_at: f64,
}

impl Default for MuscleRecoveryConfig {
    fn default() -> Self {
        MuscleRecoveryConfig {
            fatigue_per_set: 25.0,
            max_event_fatigue: 100.0,
            eccentric_factor: 1.2,
            unrated_rpe: 7.0,
            full_recovery_threshold: 5.0,
            ready_below: 20.0,
            not_ready_at: 50.0,
        }
    }
}

/// Recovery state of one muscle group at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuscleRecoveryState {
    pub muscle: MuscleGroup,
    pub category: MuscleCategory,

    /// Remaining fatigue on the 0-100 scale
    pub fatigue_level: f64,

    /// Uncapped sum of decayed contributions
    pub raw_fatigue: f64,

    /// When remaining fatigue drops to the recovery threshold; `None` if already there
    pub estimated_full_recovery_at: Option<DateTime<Utc>>,

    /// Decay time constant used, in hours
    pub tau_hours: f64,

    pub status: RecoveryStatus,
}

impl fmt::Display for MuscleRecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:.1} ({})", self.muscle, self.fatigue_level, self.status)
    }
}

/// Exponential-decay recovery tracker
#[derive(Debug, Clone, Default)]
pub struct MuscleRecoveryTracker {
    config: MuscleRecoveryConfig,
}

impl MuscleRecoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MuscleRecoveryConfig) -> Self {
        MuscleRecoveryTracker { config }
    }

    pub fn config(&self) -> &MuscleRecoveryConfig {
        &self.config
    }

    /// Decay time constant in hours for a body region
    pub fn tau_hours(&self, category: MuscleCategory, params: &RecoveryParameters) -> f64 {
        let hours = params.recovery_hours(category).max(1.0);
        let threshold = self.config.full_recovery_threshold.clamp(0.01, 99.0);
        hours / (100.0 / threshold).ln()
    }

    /// Fatigue one event deposits on each of its primary muscles
    ///
    /// # Algorithm
    ///
    /// `min(max_event_fatigue, sets × fatigue_per_set × rpe/10 × eccentric × resistance_scale)`
    /// where `resistance_scale = 1 − (fatigue_resistance − 50) / 200`.
    pub fn event_fatigue(&self, event: &TrainingEvent, params: &RecoveryParameters) -> f64 {
        if event.sets == 0 || event.reps == 0 {
            return 0.0;
        }

        let rpe = event.rpe_or(self.config.unrated_rpe);
        let mut fatigue = event.sets as f64 * self.config.fatigue_per_set * rpe / 10.0;
        if event.is_eccentric {
            fatigue *= self.config.eccentric_factor;
        }
        fatigue *= resistance_scale(params);

        fatigue.clamp(0.0, self.config.max_event_fatigue)
    }

    /// Uncapped remaining fatigue from events at or before `t`
    pub fn raw_fatigue_at(
        &self,
        events: &[TrainingEvent],
        muscle: MuscleGroup,
        t: DateTime<Utc>,
        params: &RecoveryParameters,
    ) -> f64 {
        self.decayed_sum(events, muscle, t, params, |ts| ts <= t)
    }

    /// Remaining fatigue from events strictly before `t`
    pub fn raw_fatigue_before(
        &self,
        events: &[TrainingEvent],
        muscle: MuscleGroup,
        t: DateTime<Utc>,
        params: &RecoveryParameters,
    ) -> f64 {
        self.decayed_sum(events, muscle, t, params, |ts| ts < t)
    }

    fn decayed_sum<F>(
        &self,
        events: &[TrainingEvent],
        muscle: MuscleGroup,
        t: DateTime<Utc>,
        params: &RecoveryParameters,
        include: F,
    ) -> f64
    where
        F: Fn(DateTime<Utc>) -> bool,
    {
        let tau = self.tau_hours(muscle.category(), params);

        events
            .iter()
            .filter(|e| e.touches(muscle) && include(e.timestamp))
            .map(|e| {
                let age_hours = (t - e.timestamp).num_milliseconds() as f64 / MILLIS_PER_HOUR;
                self.event_fatigue(e, params) * (-age_hours / tau).exp()
            })
            .sum::<f64>()
            .max(0.0)
    }

    /// Recovery state of one muscle at `t`
    ///
    /// A muscle with no history returns a zero-fatigue `Ready` state.
    pub fn state_at(
        &self,
        events: &[TrainingEvent],
        muscle: MuscleGroup,
        t: DateTime<Utc>,
        params: &RecoveryParameters,
    ) -> MuscleRecoveryState {
        let category = muscle.category();
        let tau_hours = self.tau_hours(category, params);
        let raw_fatigue = self.raw_fatigue_at(events, muscle, t, params);
        let fatigue_level = raw_fatigue.min(100.0);

        MuscleRecoveryState {
            muscle,
            category,
            fatigue_level,
            raw_fatigue,
            estimated_full_recovery_at: self.recovery_time(raw_fatigue, tau_hours, t),
            tau_hours,
            status: self.classify(fatigue_level),
        }
    }

    /// States for every muscle touched by events at or before `t`, ordered by muscle
    pub fn states_at(
        &self,
        events: &[TrainingEvent],
        t: DateTime<Utc>,
        params: &RecoveryParameters,
    ) -> Vec<MuscleRecoveryState> {
        let touched: BTreeSet<MuscleGroup> = events
            .iter()
            .filter(|e| e.timestamp <= t)
            .flat_map(|e| e.primary_muscles.iter().copied())
            .collect();

        touched
            .into_iter()
            .map(|muscle| self.state_at(events, muscle, t, params))
            .collect()
    }

    /// Mean fatigue level per body region
    pub fn category_fatigue(states: &[MuscleRecoveryState]) -> BTreeMap<MuscleCategory, f64> {
        let mut sums: BTreeMap<MuscleCategory, (f64, usize)> = BTreeMap::new();
        for state in states {
            sums.entry(state.category)
                .and_modify(|(sum, count)| {
                    *sum += state.fatigue_level;
                    *count += 1;
                })
                .or_insert((state.fatigue_level, 1));
        }

        sums.into_iter()
            .map(|(category, (sum, count))| (category, sum / count as f64))
            .collect()
    }

    pub fn classify(&self, fatigue_level: f64) -> RecoveryStatus {
        if fatigue_level >= self.config.not_ready_at {
            RecoveryStatus::NotReady
        } else if fatigue_level < self.config.ready_below {
            RecoveryStatus::Ready
        } else {
            RecoveryStatus::PartiallyRecovered
        }
    }

    /// Solve `raw · e^(−Δ/τ) = threshold` for the crossing time
    fn recovery_time(&self, raw_fatigue: f64, tau_hours: f64, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let threshold = self.config.full_recovery_threshold;
        if raw_fatigue <= threshold || threshold <= 0.0 {
            return None;
        }

        let hours = tau_hours * (raw_fatigue / threshold).ln();
        Some(t + Duration::milliseconds((hours * MILLIS_PER_HOUR).round() as i64))
    }
}

fn resistance_scale(params: &RecoveryParameters) -> f64 {
    (1.0 - (params.fatigue_resistance - 50.0) / 200.0).clamp(0.75, 1.25)
}
