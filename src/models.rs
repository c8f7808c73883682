use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Muscle groups tracked by the recovery model
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuscleGroup {
    Chest,
    Back,
    Shoulders,
    Biceps,
    Triceps,
    Forearms,
    Core,
    Quadriceps,
    Hamstrings,
    Glutes,
    Calves,
}

/// Coarse body region used for recovery-rate calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuscleCategory {
    Upper,
    Lower,
}

impl MuscleGroup {
    pub const ALL: [MuscleGroup; 11] = [
        MuscleGroup::Chest,
        MuscleGroup::Back,
        MuscleGroup::Shoulders,
        MuscleGroup::Biceps,
        MuscleGroup::Triceps,
        MuscleGroup::Forearms,
        MuscleGroup::Core,
        MuscleGroup::Quadriceps,
        MuscleGroup::Hamstrings,
        MuscleGroup::Glutes,
        MuscleGroup::Calves,
    ];

    /// Core is grouped with the upper body; it recovers on the faster clock
    pub fn category(&self) -> MuscleCategory {
        match self {
            MuscleGroup::Quadriceps
            | MuscleGroup::Hamstrings
            | MuscleGroup::Glutes
            | MuscleGroup::Calves => MuscleCategory::Lower,
            _ => MuscleCategory::Upper,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MuscleGroup::Chest => "chest",
            MuscleGroup::Back => "back",
            MuscleGroup::Shoulders => "shoulders",
            MuscleGroup::Biceps => "biceps",
            MuscleGroup::Triceps => "triceps",
            MuscleGroup::Forearms => "forearms",
            MuscleGroup::Core => "core",
            MuscleGroup::Quadriceps => "quadriceps",
            MuscleGroup::Hamstrings => "hamstrings",
            MuscleGroup::Glutes => "glutes",
            MuscleGroup::Calves => "calves",
        }
    }
}

impl fmt::Display for MuscleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MuscleGroup {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "chest" | "pecs" => Ok(MuscleGroup::Chest),
            "back" | "lats" => Ok(MuscleGroup::Back),
            "shoulders" | "delts" => Ok(MuscleGroup::Shoulders),
            "biceps" => Ok(MuscleGroup::Biceps),
            "triceps" => Ok(MuscleGroup::Triceps),
            "forearms" => Ok(MuscleGroup::Forearms),
            "core" | "abs" => Ok(MuscleGroup::Core),
            "quadriceps" | "quads" => Ok(MuscleGroup::Quadriceps),
            "hamstrings" | "hams" => Ok(MuscleGroup::Hamstrings),
            "glutes" => Ok(MuscleGroup::Glutes),
            "calves" => Ok(MuscleGroup::Calves),
            other => Err(EngineError::invalid(
                "muscle",
                format!("unknown muscle group: {}", other),
            )),
        }
    }
}

impl fmt::Display for MuscleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuscleCategory::Upper => write!(f, "upper"),
            MuscleCategory::Lower => write!(f, "lower"),
        }
    }
}

/// Rate of Perceived Exertion, 1-10 in half-point steps
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Rpe(f64);

impl Rpe {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(1.0..=10.0).contains(&value) {
            return Err(EngineError::invalid(
                "rpe",
                format!("{} is outside 1-10", value),
            ));
        }
        if (value * 2.0).fract() != 0.0 {
            return Err(EngineError::invalid(
                "rpe",
                format!("{} is not on half-point granularity", value),
            ));
        }
        Ok(Rpe(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Rpe {
    type Error = EngineError;

    fn try_from(value: f64) -> Result<Self> {
        Rpe::new(value)
    }
}

impl From<Rpe> for f64 {
    fn from(rpe: Rpe) -> f64 {
        rpe.0
    }
}

/// Largest set count accepted for one exercise
pub const MAX_SETS: u32 = 100;

/// Largest rep count accepted per set
pub const MAX_REPS: u32 = 1_000;

/// Largest load accepted per rep, in the user's logging unit
pub const MAX_LOAD: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// One exercise performed within one logged session
///
/// Events are immutable once logged. Soft-deleting the parent session
/// tombstones them in the store; they never reach the simulators again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEvent {
    /// Unique identifier for the event
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Parent session
    pub session_id: String,

    /// When the exercise began
    pub timestamp: DateTime<Utc>,

    /// Exercise identifier (e.g. "bench_press")
    pub exercise_id: String,

    /// Primary muscle groups loaded by the exercise
    pub primary_muscles: BTreeSet<MuscleGroup>,

    pub sets: u32,

    /// Reps per set
    pub reps: u32,

    /// Weight moved per rep, in the user's logging unit
    pub load: Decimal,

    /// Reported effort; `None` when the user skipped rating
    pub rpe: Option<Rpe>,

    pub is_eccentric: bool,

    pub is_ballistic: bool,

    /// Average set duration in seconds
    pub set_duration_secs: Option<u32>,

    /// Rest between sets in seconds
    pub rest_interval_secs: Option<u32>,
}

impl TrainingEvent {
    /// Create a validated event with a fresh identifier
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        exercise_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        primary_muscles: impl IntoIterator<Item = MuscleGroup>,
        sets: u32,
        reps: u32,
        load: Decimal,
        rpe: Option<f64>,
    ) -> Result<Self> {
        if load < Decimal::ZERO {
            return Err(EngineError::invalid(
                "load",
                format!("{} must be non-negative", load),
            ));
        }
        if load > MAX_LOAD {
            return Err(EngineError::invalid(
                "load",
                format!("{} exceeds the maximum of {}", load, MAX_LOAD),
            ));
        }
        if sets > MAX_SETS {
            return Err(EngineError::invalid(
                "sets",
                format!("{} exceeds the maximum of {}", sets, MAX_SETS),
            ));
        }
        if reps > MAX_REPS {
            return Err(EngineError::invalid(
                "reps",
                format!("{} exceeds the maximum of {}", reps, MAX_REPS),
            ));
        }
        let rpe = rpe.map(Rpe::new).transpose()?;
        let primary_muscles: BTreeSet<MuscleGroup> = primary_muscles.into_iter().collect();
        if primary_muscles.is_empty() {
            return Err(EngineError::invalid(
                "primary_muscles",
                "at least one muscle group is required",
            ));
        }

        Ok(TrainingEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            timestamp,
            exercise_id: exercise_id.into(),
            primary_muscles,
            sets,
            reps,
            load,
            rpe,
            is_eccentric: false,
            is_ballistic: false,
            set_duration_secs: None,
            rest_interval_secs: None,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_eccentric(mut self, is_eccentric: bool) -> Self {
        self.is_eccentric = is_eccentric;
        self
    }

    pub fn with_ballistic(mut self, is_ballistic: bool) -> Self {
        self.is_ballistic = is_ballistic;
        self
    }

    pub fn with_timing(mut self, set_duration_secs: Option<u32>, rest_interval_secs: Option<u32>) -> Self {
        self.set_duration_secs = set_duration_secs;
        self.rest_interval_secs = rest_interval_secs;
        self
    }

    /// Completed volume: sets × reps × load
    ///
    /// Saturates at `Decimal::MAX` for events built outside the validating
    /// constructor.
    pub fn volume(&self) -> Decimal {
        Decimal::from(self.sets)
            .saturating_mul(Decimal::from(self.reps))
            .saturating_mul(self.load)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume().to_f64().unwrap_or(0.0)
    }

    /// RPE value, substituting `unrated` when the set was not rated
    pub fn rpe_or(&self, unrated: f64) -> f64 {
        self.rpe.map(|r| r.value()).unwrap_or(unrated)
    }

    /// Estimated one-rep max (Epley)
    pub fn estimated_one_rep_max(&self) -> f64 {
        let load = self.load.to_f64().unwrap_or(0.0);
        if self.reps == 0 {
            return 0.0;
        }
        load * (1.0 + self.reps as f64 / 30.0)
    }

    pub fn touches(&self, muscle: MuscleGroup) -> bool {
        self.primary_muscles.contains(&muscle)
    }
}

/// One calendar day of recovery-relevant context
///
/// Every field is optional. Missing data never raises an error; the
/// readiness score simply skips the corresponding adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSample {
    pub user_id: String,

    pub date: NaiveDate,

    pub sleep_hours: Option<f64>,

    /// Subjective sleep quality (1-10)
    pub sleep_quality: Option<u8>,

    /// Subjective stress (1-10, higher is more stressed)
    pub stress: Option<u8>,

    /// Nutrition quality (1-10)
    pub nutrition_quality: Option<u8>,

    /// General soreness (1-10)
    pub soreness: Option<u8>,
}

impl ContextSample {
    pub fn empty(user_id: impl Into<String>, date: NaiveDate) -> Self {
        ContextSample {
            user_id: user_id.into(),
            date,
            sleep_hours: None,
            sleep_quality: None,
            stress: None,
            nutrition_quality: None,
            soreness: None,
        }
    }

    /// Reject out-of-range values at the ingestion boundary
    pub fn validate(&self) -> Result<()> {
        if let Some(hours) = self.sleep_hours {
            if !hours.is_finite() || !(0.0..=24.0).contains(&hours) {
                return Err(EngineError::invalid(
                    "sleep_hours",
                    format!("{} is outside 0-24", hours),
                ));
            }
        }

        let scales = [
            ("sleep_quality", self.sleep_quality),
            ("stress", self.stress),
            ("nutrition_quality", self.nutrition_quality),
            ("soreness", self.soreness),
        ];
        for (field, value) in scales {
            if let Some(v) = value {
                if !(1..=10).contains(&v) {
                    return Err(EngineError::invalid(field, format!("{} is outside 1-10", v)));
                }
            }
        }

        Ok(())
    }
}

/// Per-user calibrated recovery constants
///
/// Written only by the calibration layer; every simulator reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryParameters {
    /// Hours for a fully fatigued upper-body muscle to recover
    pub upper_recovery_hours: f64,

    /// Hours for a fully fatigued lower-body muscle to recover
    pub lower_recovery_hours: f64,

    /// Fatigue resistance score (0-100, population mean 50)
    pub fatigue_resistance: f64,

    pub last_calibrated_at: Option<DateTime<Utc>>,

    /// Calibration confidence (0-1)
    pub confidence: f64,

    /// Completed sessions the current estimate is based on
    pub session_count: u32,
}

impl RecoveryParameters {
    pub const DEFAULT_UPPER_HOURS: f64 = 48.0;
    pub const DEFAULT_LOWER_HOURS: f64 = 72.0;
    pub const DEFAULT_FATIGUE_RESISTANCE: f64 = 50.0;

    pub fn population_default() -> Self {
        RecoveryParameters {
            upper_recovery_hours: Self::DEFAULT_UPPER_HOURS,
            lower_recovery_hours: Self::DEFAULT_LOWER_HOURS,
            fatigue_resistance: Self::DEFAULT_FATIGUE_RESISTANCE,
            last_calibrated_at: None,
            confidence: 0.0,
            session_count: 0,
        }
    }

    pub fn recovery_hours(&self, category: MuscleCategory) -> f64 {
        match category {
            MuscleCategory::Upper => self.upper_recovery_hours,
            MuscleCategory::Lower => self.lower_recovery_hours,
        }
    }

    /// Mean ratio of calibrated to population recovery hours
    pub fn recovery_scale(&self) -> f64 {
        let upper = self.upper_recovery_hours / Self::DEFAULT_UPPER_HOURS;
        let lower = self.lower_recovery_hours / Self::DEFAULT_LOWER_HOURS;
        (upper + lower) / 2.0
    }

    pub fn is_calibrated(&self) -> bool {
        self.last_calibrated_at.is_some()
    }
}

impl Default for RecoveryParameters {
    fn default() -> Self {
        Self::population_default()
    }
}
