//! Banister impulse-response (fitness-fatigue) model
//!
//! Each training event contributes an impulse `w` to two exponentially
//! decaying accumulators:
//!
//! - **Fitness** decays slowly (default time constant 7 days)
//! - **Fatigue** decays fast (default time constant 2 days)
//!
//! Predicted performance is `baseline + fitness − fatigue`.
//!
//! The model supports incremental updates: a state at `t0` advanced with the
//! events in `(t0, t1]` equals a full replay through `t1`, so callers holding
//! a cached state only ever touch recent events.

use crate::models::{RecoveryParameters, TrainingEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Weighting that turns a logged exercise into a training impulse
///
/// `w = volume / volume_unit × (rpe / reference_rpe)^rpe_exponent`
/// scaled by the eccentric and ballistic factors when those flags are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpulseConfig {
    /// Volume that counts as one impulse unit at the reference RPE
    pub volume_unit: f64,

    /// RPE at which volume is taken at face value
    pub reference_rpe: f64,

    /// Exponent on the RPE ratio; higher values punish grinding sets harder
    pub rpe_exponent: f64,

    /// RPE assumed for unrated sets
    pub unrated_rpe: f64,

    pub eccentric_factor: f64,

    pub ballistic_factor: f64,
}

impl Default for ImpulseConfig {
    fn default() -> Self {
        ImpulseConfig {
            volume_unit: 1000.0,
            reference_rpe: 7.0,
            rpe_exponent: 2.0,
            unrated_rpe: 7.0,
            eccentric_factor: 1.1,
            ballistic_factor: 1.05,
        }
    }
}

impl ImpulseConfig {
    /// Training impulse for one event (never negative)
    pub fn impulse(&self, event: &TrainingEvent) -> f64 {
        let volume = event.volume_f64();
        if volume <= 0.0 || self.volume_unit <= 0.0 {
            return 0.0;
        }

        let rpe = event.rpe_or(self.unrated_rpe);
        let intensity = (rpe / self.reference_rpe).powf(self.rpe_exponent);

        let mut w = volume / self.volume_unit * intensity;
        if event.is_eccentric {
            w *= self.eccentric_factor;
        }
        if event.is_ballistic {
            w *= self.ballistic_factor;
        }

        w.max(0.0)
    }
}

/// Time constants and gains of the impulse-response model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanisterConfig {
    /// Fitness decay time constant in days (default: 7)
    pub fitness_tau_days: f64,

    /// Fatigue decay time constant in days (default: 2)
    pub fatigue_tau_days: f64,

    pub fitness_gain: f64,

    pub fatigue_gain: f64,

    /// Calibration confidence required before personal constants replace the defaults
    pub adaptive_min_confidence: f64,
}

impl Default for BanisterConfig {
    fn default() -> Self {
        BanisterConfig {
            fitness_tau_days: 7.0,
            fatigue_tau_days: 2.0,
            fitness_gain: 1.0,
            fatigue_gain: 1.0,
            adaptive_min_confidence: 0.5,
        }
    }
}

impl BanisterConfig {
    /// Personalise the fatigue constant once calibration is trustworthy
    ///
    /// Slower recoverers get a proportionally longer fatigue time constant;
    /// fatigue-resistant users accrue less fatigue per unit impulse.
    pub fn adapted_to(&self, params: &RecoveryParameters) -> BanisterConfig {
        if params.confidence < self.adaptive_min_confidence {
            return self.clone();
        }

        let resistance_scale = (1.0 - (params.fatigue_resistance - 50.0) / 200.0).clamp(0.75, 1.25);

        BanisterConfig {
            fatigue_tau_days: self.fatigue_tau_days * params.recovery_scale().clamp(0.5, 2.0),
            fatigue_gain: self.fatigue_gain * resistance_scale,
            ..self.clone()
        }
    }
}

/// Fitness and fatigue accumulators at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FatigueState {
    pub at: DateTime<Utc>,
    pub fitness: f64,
    pub fatigue: f64,
}

impl FatigueState {
    pub fn zero(at: DateTime<Utc>) -> Self {
        FatigueState {
            at,
            fitness: 0.0,
            fatigue: 0.0,
        }
    }

    pub fn performance(&self, baseline: f64) -> f64 {
        baseline + self.fitness - self.fatigue
    }

    /// Normalised form in [-1, 1]; 0 when nothing has been trained
    pub fn form(&self) -> f64 {
        let total = self.fitness + self.fatigue;
        if total <= f64::EPSILON {
            0.0
        } else {
            (self.fitness - self.fatigue) / total
        }
    }

    /// Share of the combined load that is fatigue, in [0, 1]
    pub fn fatigue_fraction(&self) -> f64 {
        let total = self.fitness + self.fatigue;
        if total <= f64::EPSILON {
            0.0
        } else {
            self.fatigue / total
        }
    }
}

/// One sample of a simulated fitness-fatigue series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatiguePoint {
    pub at: DateTime<Utc>,
    pub fitness: f64,
    pub fatigue: f64,
    pub performance: f64,
}

/// Dual-exponential fitness-fatigue simulator
#[derive(Debug, Clone, Default)]
pub struct FitnessFatigueModel {
    banister: BanisterConfig,
    impulse: ImpulseConfig,
}

impl FitnessFatigueModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(banister: BanisterConfig, impulse: ImpulseConfig) -> Self {
        FitnessFatigueModel { banister, impulse }
    }

    /// Model using the user's calibrated constants where confidence allows
    pub fn for_parameters(
        banister: &BanisterConfig,
        impulse: &ImpulseConfig,
        params: &RecoveryParameters,
    ) -> Self {
        FitnessFatigueModel {
            banister: banister.adapted_to(params),
            impulse: impulse.clone(),
        }
    }

    pub fn banister(&self) -> &BanisterConfig {
        &self.banister
    }

    pub fn impulse(&self, event: &TrainingEvent) -> f64 {
        self.impulse.impulse(event)
    }

    /// Advance `state` to `t1`, folding in the events in `(state.at, t1]`
    ///
    /// Events outside that window are ignored, so callers may pass a wider
    /// slice. A target earlier than the state leaves it unchanged.
    pub fn advance(&self, state: &FatigueState, events: &[TrainingEvent], t1: DateTime<Utc>) -> FatigueState {
        if t1 < state.at {
            return *state;
        }

        let elapsed = days_between(state.at, t1);
        let mut fitness = state.fitness * decay(elapsed, self.banister.fitness_tau_days);
        let mut fatigue = state.fatigue * decay(elapsed, self.banister.fatigue_tau_days);

        for event in events
            .iter()
            .filter(|e| e.timestamp > state.at && e.timestamp <= t1)
        {
            let w = self.impulse.impulse(event);
            let age = days_between(event.timestamp, t1);
            fitness += self.banister.fitness_gain * w * decay(age, self.banister.fitness_tau_days);
            fatigue += self.banister.fatigue_gain * w * decay(age, self.banister.fatigue_tau_days);
        }

        FatigueState {
            at: t1,
            fitness: fitness.max(0.0),
            fatigue: fatigue.max(0.0),
        }
    }

    /// Full replay of `events` through `t`, starting from zero before the first event
    pub fn replay(&self, events: &[TrainingEvent], t: DateTime<Utc>) -> FatigueState {
        let earliest = match events.iter().map(|e| e.timestamp).min() {
            Some(ts) if ts <= t => ts,
            _ => return FatigueState::zero(t),
        };

        let origin = FatigueState::zero(earliest - Duration::milliseconds(1));
        self.advance(&origin, events, t)
    }

    /// Sample the model from `start` to `end` every `step`
    pub fn series(
        &self,
        events: &[TrainingEvent],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        baseline: f64,
    ) -> Vec<FatiguePoint> {
        let mut points = Vec::new();
        if end < start || step <= Duration::zero() {
            return points;
        }

        let mut state = self.replay(events, start);
        loop {
            points.push(FatiguePoint {
                at: state.at,
                fitness: state.fitness,
                fatigue: state.fatigue,
                performance: state.performance(baseline),
            });

            let next = state.at + step;
            if next > end {
                break;
            }
            state = self.advance(&state, events, next);
        }

        points
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_DAY
}

fn decay(days: f64, tau_days: f64) -> f64 {
    if tau_days <= 0.0 {
        return 0.0;
    }
    (-days / tau_days).exp()
}
