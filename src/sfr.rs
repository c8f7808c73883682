//! Stimulus-to-fatigue ratio (SFR) analysis
//!
//! SFR scores how much productive stimulus an exercise delivered per unit
//! of fatigue it cost:
//!
//! ```text
//! SFR = effective_volume / fatigue_cost
//! ```
//!
//! The cost of an exercise is charged against the fatigue that existed
//! immediately before it began. Exercises of a session are walked in
//! temporal order and the fitness-fatigue state is threaded through them,
//! so an exercise's score never depends on anything logged after it.

use crate::fitness_fatigue::{FatigueState, FitnessFatigueModel};
use crate::models::{RecoveryParameters, TrainingEvent};
use crate::muscle::MuscleRecoveryTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// SFR efficiency zones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SfrZone {
    /// SFR above the excellent threshold (default > 200)
    Excellent,
    /// Between the junk and excellent thresholds (default 50-200)
    Acceptable,
    /// Below the junk threshold (default < 50); candidate for substitution
    JunkVolume,
}

impl SfrZone {
    pub fn from_sfr(sfr: f64, config: &SfrConfig) -> Self {
        if sfr > config.excellent_above {
            SfrZone::Excellent
        } else if sfr < config.junk_below {
            SfrZone::JunkVolume
        } else {
            SfrZone::Acceptable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SfrZone::Excellent => "excellent",
            SfrZone::Acceptable => "acceptable",
            SfrZone::JunkVolume => "junk_volume",
        }
    }
}

impl fmt::Display for SfrZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SfrZone::Excellent => write!(f, "Excellent"),
            SfrZone::Acceptable => write!(f, "Acceptable"),
            SfrZone::JunkVolume => write!(f, "Junk Volume"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfrConfig {
    pub excellent_above: f64,
    pub junk_below: f64,

    /// Weight of pre-existing local muscle fatigue on the cost
    pub local_carryover: f64,

    /// Weight of systemic fatigue share on the cost
    pub systemic_carryover: f64,

    /// Smallest cost used as a divisor
    pub cost_floor: f64,

    /// RPE assumed for unrated sets
    pub unrated_rpe: f64,
}

impl Default for SfrConfig {
    fn default() -> Self {
        SfrConfig {
            excellent_above: 200.0,
            junk_below: 50.0,
            local_carryover: 0.5,
            systemic_carryover: 0.25,
            cost_floor: 1e-6,
            unrated_rpe: 7.0,
        }
    }
}

/// Efficiency of one exercise within its session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseEfficiency {
    pub event_id: String,
    pub exercise_id: String,
    pub performed_at: DateTime<Utc>,
    pub effective_volume: f64,
    pub fatigue_cost: f64,
    pub sfr: f64,
    pub zone: SfrZone,
    pub needs_substitution: bool,
}

/// Session-level rollup of exercise efficiencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEfficiencySummary {
    pub exercise_count: usize,
    pub mean_sfr: Option<f64>,
    pub excellent_count: usize,
    pub junk_count: usize,
    pub total_effective_volume: f64,
}

/// Causally-scoped SFR calculator
#[derive(Debug, Clone, Default)]
pub struct SfrAnalyzer {
    config: SfrConfig,
    model: FitnessFatigueModel,
    tracker: MuscleRecoveryTracker,
}

impl SfrAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_components(
        config: SfrConfig,
        model: FitnessFatigueModel,
        tracker: MuscleRecoveryTracker,
    ) -> Self {
        SfrAnalyzer {
            config,
            model,
            tracker,
        }
    }

    pub fn config(&self) -> &SfrConfig {
        &self.config
    }

    /// Stimulus weight by proximity to failure
    ///
    /// RPE ≥ 9 counts fully, 7-8.5 at 0.7, anything easier at 0.4.
    pub fn proximity_weight(&self, rpe: f64) -> f64 {
        if rpe >= 9.0 {
            1.0
        } else if rpe >= 7.0 {
            0.7
        } else {
            0.4
        }
    }

    pub fn effective_volume(&self, event: &TrainingEvent) -> f64 {
        event.volume_f64() * self.proximity_weight(event.rpe_or(self.config.unrated_rpe))
    }

    /// Score each exercise of a session in temporal order
    ///
    /// `history` may contain anything the user logged; only events strictly
    /// before the session's first exercise (and not part of the session) are
    /// treated as prior load. Within the session, each exercise sees the
    /// fatigue of the exercises before it and nothing after.
    pub fn analyze_session(
        &self,
        history: &[TrainingEvent],
        session: &[TrainingEvent],
        params: &RecoveryParameters,
    ) -> Vec<ExerciseEfficiency> {
        let mut ordered: Vec<&TrainingEvent> = session.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let first = match ordered.first() {
            Some(event) => event.timestamp,
            None => return Vec::new(),
        };

        let session_ids: HashSet<&str> = ordered.iter().map(|e| e.id.as_str()).collect();
        let mut prior: Vec<TrainingEvent> = history
            .iter()
            .filter(|e| e.timestamp < first && !session_ids.contains(e.id.as_str()))
            .cloned()
            .collect();

        let mut state = self.model.replay(&prior, first);
        let mut results = Vec::with_capacity(ordered.len());

        for event in ordered {
            state = self.model.advance(&state, &[], event.timestamp);
            let efficiency = self.score(event, &prior, &state, params);

            debug!(
                event_id = %event.id,
                exercise = %event.exercise_id,
                sfr = efficiency.sfr,
                zone = efficiency.zone.as_str(),
                "Scored exercise"
            );

            results.push(efficiency);
            state = self.absorb(&state, event);
            prior.push(event.clone());
        }

        results
    }

    fn score(
        &self,
        event: &TrainingEvent,
        prior: &[TrainingEvent],
        state_before: &FatigueState,
        params: &RecoveryParameters,
    ) -> ExerciseEfficiency {
        let prior_local = if event.primary_muscles.is_empty() {
            0.0
        } else {
            event
                .primary_muscles
                .iter()
                .map(|m| {
                    self.tracker
                        .raw_fatigue_at(prior, *m, event.timestamp, params)
                        .min(100.0)
                })
                .sum::<f64>()
                / event.primary_muscles.len() as f64
        };

        let increment = self.tracker.event_fatigue(event, params);
        let fatigue_cost = increment
            * (1.0
                + self.config.local_carryover * prior_local / 100.0
                + self.config.systemic_carryover * state_before.fatigue_fraction());

        let effective_volume = self.effective_volume(event);
        let sfr = if effective_volume <= 0.0 {
            0.0
        } else {
            effective_volume / fatigue_cost.max(self.config.cost_floor)
        };
        let zone = SfrZone::from_sfr(sfr, &self.config);

        ExerciseEfficiency {
            event_id: event.id.clone(),
            exercise_id: event.exercise_id.clone(),
            performed_at: event.timestamp,
            effective_volume,
            fatigue_cost,
            sfr,
            zone,
            needs_substitution: zone == SfrZone::JunkVolume,
        }
    }

    /// Fold one event into a state already positioned at the event's time
    fn absorb(&self, state: &FatigueState, event: &TrainingEvent) -> FatigueState {
        let w = self.model.impulse(event);
        let banister = self.model.banister();
        FatigueState {
            at: state.at,
            fitness: (state.fitness + banister.fitness_gain * w).max(0.0),
            fatigue: (state.fatigue + banister.fatigue_gain * w).max(0.0),
        }
    }

    pub fn summarize(&self, efficiencies: &[ExerciseEfficiency]) -> SessionEfficiencySummary {
        let count = efficiencies.len();
        let mean_sfr = if count == 0 {
            None
        } else {
            Some(efficiencies.iter().map(|e| e.sfr).sum::<f64>() / count as f64)
        };

        SessionEfficiencySummary {
            exercise_count: count,
            mean_sfr,
            excellent_count: efficiencies
                .iter()
                .filter(|e| e.zone == SfrZone::Excellent)
                .count(),
            junk_count: efficiencies.iter().filter(|e| e.needs_substitution).count(),
            total_effective_volume: efficiencies.iter().map(|e| e.effective_volume).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MuscleGroup;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    fn exercise(
        id: &str,
        exercise_id: &str,
        minutes: i64,
        muscles: &[MuscleGroup],
        sets: u32,
        reps: u32,
        load: Decimal,
        rpe: Option<f64>,
    ) -> TrainingEvent {
        TrainingEvent::new(
            "test_user",
            "session_1",
            exercise_id,
            start() + Duration::minutes(minutes),
            muscles.iter().copied(),
            sets,
            reps,
            load,
            rpe,
        )
        .unwrap()
        .with_id(id)
    }

    fn heavy_bench() -> TrainingEvent {
        exercise("e1", "bench_press", 0, &[MuscleGroup::Chest, MuscleGroup::Triceps], 4, 5, dec!(275), Some(9.0))
    }

    fn light_flyes() -> TrainingEvent {
        exercise("e2", "cable_fly", 20, &[MuscleGroup::Chest], 3, 15, dec!(40), Some(6.0))
    }

    #[test]
    fn test_proximity_weights() {
        let analyzer = SfrAnalyzer::new();
        assert_eq!(analyzer.proximity_weight(10.0), 1.0);
        assert_eq!(analyzer.proximity_weight(9.0), 1.0);
        assert_eq!(analyzer.proximity_weight(8.5), 0.7);
        assert_eq!(analyzer.proximity_weight(7.0), 0.7);
        assert_eq!(analyzer.proximity_weight(6.5), 0.4);
    }

    #[test]
    fn test_zone_thresholds() {
        let config = SfrConfig::default();
        assert_eq!(SfrZone::from_sfr(250.0, &config), SfrZone::Excellent);
        assert_eq!(SfrZone::from_sfr(200.0, &config), SfrZone::Acceptable);
        assert_eq!(SfrZone::from_sfr(50.0, &config), SfrZone::Acceptable);
        assert_eq!(SfrZone::from_sfr(49.9, &config), SfrZone::JunkVolume);
    }

    #[test]
    fn test_first_exercise_pays_only_its_own_cost() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();
        let bench = heavy_bench();

        let results = analyzer.analyze_session(&[], &[bench.clone(), light_flyes()], &params);
        let own_cost = MuscleRecoveryTracker::new().event_fatigue(&bench, &params);

        assert_eq!(results[0].event_id, "e1");
        assert!((results[0].fatigue_cost - own_cost).abs() < 1e-9);
        assert!((results[0].effective_volume - 5500.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_exercise_independent_of_later_ones() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();

        let alone = analyzer.analyze_session(&[], &[heavy_bench()], &params);
        let with_followup = analyzer.analyze_session(&[], &[heavy_bench(), light_flyes()], &params);

        assert_eq!(alone[0].sfr, with_followup[0].sfr);
        assert_eq!(alone[0].fatigue_cost, with_followup[0].fatigue_cost);
        assert_eq!(alone[0].zone, with_followup[0].zone);
    }

    #[test]
    fn test_later_exercise_carries_earlier_fatigue() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();

        let fresh = analyzer.analyze_session(&[], &[light_flyes()], &params);
        let after_bench = analyzer.analyze_session(&[], &[heavy_bench(), light_flyes()], &params);

        assert!(after_bench[1].fatigue_cost > fresh[0].fatigue_cost);
        assert!(after_bench[1].sfr < fresh[0].sfr);
    }

    #[test]
    fn test_session_order_is_temporal_not_input_order() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();

        let results = analyzer.analyze_session(&[], &[light_flyes(), heavy_bench()], &params);
        assert_eq!(results[0].exercise_id, "bench_press");
        assert_eq!(results[1].exercise_id, "cable_fly");
    }

    #[test]
    fn test_prior_history_raises_cost() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();
        let yesterday = exercise(
            "h1",
            "incline_press",
            -24 * 60,
            &[MuscleGroup::Chest],
            5,
            8,
            dec!(185),
            Some(9.0),
        );

        let fresh = analyzer.analyze_session(&[], &[heavy_bench()], &params);
        let fatigued = analyzer.analyze_session(&[yesterday], &[heavy_bench()], &params);
        assert!(fatigued[0].fatigue_cost > fresh[0].fatigue_cost);
    }

    #[test]
    fn test_zero_volume_is_junk() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();
        let empty = exercise("z", "bench_press", 0, &[MuscleGroup::Chest], 3, 0, dec!(135), Some(8.0));

        let results = analyzer.analyze_session(&[], &[empty], &params);
        assert_eq!(results[0].sfr, 0.0);
        assert!(results[0].needs_substitution);
    }

    #[test]
    fn test_summary() {
        let analyzer = SfrAnalyzer::new();
        let params = RecoveryParameters::population_default();
        let results = analyzer.analyze_session(&[], &[heavy_bench(), light_flyes()], &params);

        let summary = analyzer.summarize(&results);
        assert_eq!(summary.exercise_count, 2);
        assert!(summary.mean_sfr.is_some());
        assert_eq!(
            summary.junk_count,
            results.iter().filter(|e| e.zone == SfrZone::JunkVolume).count()
        );

        assert_eq!(analyzer.summarize(&[]).mean_sfr, None);
    }

    proptest! {
        #[test]
        fn test_earlier_scores_ignore_later_exercises(
            later_sets in 1u32..10u32,
            later_load in 5u32..300u32,
            gap in 1i64..90i64,
        ) {
            let analyzer = SfrAnalyzer::new();
            let params = RecoveryParameters::population_default();
            let later = exercise(
                "later",
                "dumbbell_press",
                gap,
                &[MuscleGroup::Chest, MuscleGroup::Shoulders],
                later_sets,
                10,
                Decimal::from(later_load),
                Some(8.0),
            );

            let alone = analyzer.analyze_session(&[], &[heavy_bench()], &params);
            let both = analyzer.analyze_session(&[], &[heavy_bench(), later], &params);
            prop_assert_eq!(alone[0].sfr, both[0].sfr);
        }
    }
}
