//! Hierarchical calibration of per-user recovery parameters
//!
//! Recovery rates and fatigue resistance start at population values and
//! are pulled toward what a user's own training log shows, in proportion to
//! how much evidence there is.
//!
//! # Model
//!
//! Three levels of Gaussian partial pooling:
//!
//! 1. **Population prior**: `N(μ0, τ0²)` per parameter (e.g. upper body 48 ± 12 h)
//! 2. **Exercise level**: samples from each exercise are averaged; an
//!    exercise mean has variance `σ²/n + s²`, where `s` is the spread
//!    between exercises
//! 3. **Observations**: each repeat of an exercise compares the estimated
//!    one-rep max to the best prior effort and to the drop the fatigue
//!    model predicted; the prediction error yields one sample
//!
//! The user posterior is the precision-weighted combination of the prior and
//! the exercise means. With few observations the prior dominates; with many,
//! the user's own history does.
//!
//! Calibration never runs on the readiness path. [`CalibrationService`]
//! schedules it after completed sessions and serializes runs per user.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{MuscleCategory, RecoveryParameters, TrainingEvent};
use crate::muscle::MuscleRecoveryTracker;
use crate::store::EventStore;

/// Gaussian prior on one parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPrior {
    pub mean: f64,
    pub std_dev: f64,
}

impl NormalPrior {
    pub fn new(mean: f64, std_dev: f64) -> Self {
        NormalPrior { mean, std_dev }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub upper_hours_prior: NormalPrior,
    pub lower_hours_prior: NormalPrior,
    pub resistance_prior: NormalPrior,

    /// Noise of one recovery-hours sample
    pub hours_observation_sd: f64,

    /// Noise of one fatigue-resistance sample
    pub resistance_observation_sd: f64,

    /// Spread of true rates between exercises of one user
    pub exercise_spread_sd: f64,

    /// Completed sessions required before parameters move
    pub min_sessions: u32,

    /// Session count at which confidence reaches 0.5
    pub confidence_half_sessions: f64,

    /// Relative performance drop predicted for a fully fatigued muscle
    pub fatigue_performance_drop: f64,

    /// How strongly a prediction error rescales recovery hours
    pub hours_gain: f64,

    /// Resistance points per unit of prediction error
    pub resistance_gain: f64,

    /// Prior fatigue below this carries no information about recovery speed
    pub min_informative_fatigue: f64,

    /// Prior fatigue required before a sample informs fatigue resistance
    pub resistance_min_fatigue: f64,

    /// History considered by one run
    pub lookback_days: u32,

    pub min_recovery_hours: f64,
    pub max_recovery_hours: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            upper_hours_prior: NormalPrior::new(RecoveryParameters::DEFAULT_UPPER_HOURS, 12.0),
            lower_hours_prior: NormalPrior::new(RecoveryParameters::DEFAULT_LOWER_HOURS, 18.0),
            resistance_prior: NormalPrior::new(RecoveryParameters::DEFAULT_FATIGUE_RESISTANCE, 15.0),
            hours_observation_sd: 24.0,
            resistance_observation_sd: 25.0,
            exercise_spread_sd: 8.0,
            min_sessions: 3,
            confidence_half_sessions: 10.0,
            fatigue_performance_drop: 0.3,
            hours_gain: 1.0,
            resistance_gain: 100.0,
            min_informative_fatigue: 1.0,
            resistance_min_fatigue: 10.0,
            lookback_days: 180,
            min_recovery_hours: 12.0,
            max_recovery_hours: 168.0,
        }
    }
}

impl CalibrationConfig {
    fn hours_prior(&self, category: MuscleCategory) -> NormalPrior {
        match category {
            MuscleCategory::Upper => self.upper_hours_prior,
            MuscleCategory::Lower => self.lower_hours_prior,
        }
    }
}

/// One performance-vs-prediction comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub event_id: String,
    pub exercise_id: String,
    pub category: MuscleCategory,
    pub performed_at: DateTime<Utc>,

    /// Mean fatigue of the category's primary muscles just before the exercise
    pub prior_fatigue: f64,

    /// Estimated 1RM over the best earlier estimate for the exercise
    pub observed_ratio: f64,

    pub predicted_ratio: f64,

    /// observed − predicted; positive means the user recovered faster than modelled
    pub error: f64,

    pub hours_sample: Option<f64>,
    pub resistance_sample: Option<f64>,
}

/// Posterior summary of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    pub prior_mean: f64,
    pub posterior_mean: f64,
    pub posterior_sd: f64,

    /// Weight left on the prior (1 = no evidence)
    pub shrinkage: f64,

    pub samples: usize,

    /// 95 % credible interval
    pub credible_interval: Option<(f64, f64)>,
}

/// Exercise-level recovery estimate, shrunk toward the user posterior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseEstimate {
    pub exercise_id: String,
    pub category: MuscleCategory,
    pub samples: usize,
    pub sample_mean: f64,
    pub sample_sd: Option<f64>,
    pub pooled_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub parameters: RecoveryParameters,
    pub sessions: u32,
    pub observations: usize,
    pub upper_hours: ParameterEstimate,
    pub lower_hours: ParameterEstimate,
    pub fatigue_resistance: ParameterEstimate,
    pub exercises: Vec<ExerciseEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationOutcome {
    /// Not enough completed sessions; parameters untouched
    Skipped { sessions: u32, required: u32 },
    Updated(Box<CalibrationReport>),
    /// The run failed; last-known parameters stay in effect
    Stale { reason: String },
}

/// Pure calibration math over an event history
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    config: CalibrationConfig,
    tracker: MuscleRecoveryTracker,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CalibrationConfig, tracker: MuscleRecoveryTracker) -> Self {
        Calibrator { config, tracker }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibration confidence for a session count: `n / (n + half)`
    pub fn confidence(&self, sessions: u32) -> f64 {
        let n = sessions as f64;
        let half = self.config.confidence_half_sessions.max(f64::EPSILON);
        n / (n + half)
    }

    /// Compare every repeated exercise with what the current parameters predicted
    pub fn observations(
        &self,
        events: &[TrainingEvent],
        current: &RecoveryParameters,
    ) -> Vec<CalibrationObservation> {
        let mut ordered: Vec<&TrainingEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let mut best_e1rm: HashMap<&str, f64> = HashMap::new();
        let mut observations = Vec::new();

        for event in ordered {
            let e1rm = event.estimated_one_rep_max();
            if e1rm <= 0.0 {
                continue;
            }

            if let Some(best) = best_e1rm.get(event.exercise_id.as_str()).copied() {
                let observed_ratio = e1rm / best;
                let categories: BTreeSet<MuscleCategory> =
                    event.primary_muscles.iter().map(|m| m.category()).collect();

                for category in categories {
                    observations.push(self.observe(events, event, category, observed_ratio, current));
                }
            }

            best_e1rm
                .entry(event.exercise_id.as_str())
                .and_modify(|best| *best = best.max(e1rm))
                .or_insert(e1rm);
        }

        observations
    }

    fn observe(
        &self,
        events: &[TrainingEvent],
        event: &TrainingEvent,
        category: MuscleCategory,
        observed_ratio: f64,
        current: &RecoveryParameters,
    ) -> CalibrationObservation {
        let muscles: Vec<_> = event
            .primary_muscles
            .iter()
            .filter(|m| m.category() == category)
            .collect();
        let prior_fatigue = muscles
            .iter()
            .map(|m| {
                self.tracker
                    .raw_fatigue_before(events, **m, event.timestamp, current)
                    .min(100.0)
            })
            .sum::<f64>()
            / muscles.len().max(1) as f64;

        let predicted_ratio = 1.0 - self.config.fatigue_performance_drop * prior_fatigue / 100.0;
        let error = observed_ratio - predicted_ratio;

        let hours_sample = (prior_fatigue >= self.config.min_informative_fatigue).then(|| {
            let factor = (1.0 - self.config.hours_gain * error).clamp(0.5, 1.5);
            (current.recovery_hours(category) * factor)
                .clamp(self.config.min_recovery_hours, self.config.max_recovery_hours)
        });
        let resistance_sample = (prior_fatigue >= self.config.resistance_min_fatigue).then(|| {
            (current.fatigue_resistance + self.config.resistance_gain * error).clamp(0.0, 100.0)
        });

        CalibrationObservation {
            event_id: event.id.clone(),
            exercise_id: event.exercise_id.clone(),
            category,
            performed_at: event.timestamp,
            prior_fatigue,
            observed_ratio,
            predicted_ratio,
            error,
            hours_sample,
            resistance_sample,
        }
    }

    /// Sessions observed over the user's whole history
    ///
    /// `current` already accounts for everything up to its last calibration;
    /// only sessions that started afterwards are added. The lookback window
    /// can drop old sessions, so the total never falls below what was
    /// counted before.
    pub fn cumulative_sessions(&self, events: &[TrainingEvent], current: &RecoveryParameters) -> u32 {
        let mut first_seen: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for event in events {
            first_seen
                .entry(event.session_id.as_str())
                .and_modify(|t| *t = (*t).min(event.timestamp))
                .or_insert(event.timestamp);
        }
        let windowed = first_seen.len() as u32;

        let unseen = match current.last_calibrated_at {
            Some(last) => first_seen.values().filter(|t| **t > last).count() as u32,
            None => windowed,
        };

        current.session_count.saturating_add(unseen).max(windowed)
    }

    /// Recompute parameters from history
    ///
    /// Below `min_sessions` distinct sessions in the window the current
    /// parameters are kept and the outcome is `Skipped`. Session count and
    /// confidence never decrease across runs.
    pub fn calibrate(
        &self,
        events: &[TrainingEvent],
        current: &RecoveryParameters,
        now: DateTime<Utc>,
    ) -> CalibrationOutcome {
        let sessions = events
            .iter()
            .map(|e| e.session_id.as_str())
            .collect::<BTreeSet<_>>()
            .len() as u32;

        if sessions < self.config.min_sessions {
            debug!(sessions, required = self.config.min_sessions, "Calibration skipped");
            return CalibrationOutcome::Skipped {
                sessions,
                required: self.config.min_sessions,
            };
        }

        let total_sessions = self.cumulative_sessions(events, current);
        let observations = self.observations(events, current);

        let (upper_hours, upper_exercises) = self.pool_hours(&observations, MuscleCategory::Upper);
        let (lower_hours, lower_exercises) = self.pool_hours(&observations, MuscleCategory::Lower);

        let resistance_samples: Vec<f64> =
            observations.iter().filter_map(|o| o.resistance_sample).collect();
        let fatigue_resistance = conjugate_update(
            self.config.resistance_prior,
            self.config.resistance_observation_sd,
            &resistance_samples,
        );

        let parameters = RecoveryParameters {
            upper_recovery_hours: upper_hours
                .posterior_mean
                .clamp(self.config.min_recovery_hours, self.config.max_recovery_hours),
            lower_recovery_hours: lower_hours
                .posterior_mean
                .clamp(self.config.min_recovery_hours, self.config.max_recovery_hours),
            fatigue_resistance: fatigue_resistance.posterior_mean.clamp(0.0, 100.0),
            last_calibrated_at: Some(now),
            confidence: self.confidence(total_sessions).max(current.confidence),
            session_count: total_sessions,
        };

        let mut exercises = upper_exercises;
        exercises.extend(lower_exercises);

        CalibrationOutcome::Updated(Box::new(CalibrationReport {
            parameters,
            sessions,
            observations: observations.len(),
            upper_hours,
            lower_hours,
            fatigue_resistance,
            exercises,
        }))
    }

    /// Population → exercise → observation pooling of recovery hours
    fn pool_hours(
        &self,
        observations: &[CalibrationObservation],
        category: MuscleCategory,
    ) -> (ParameterEstimate, Vec<ExerciseEstimate>) {
        let prior = self.config.hours_prior(category);
        let sigma2 = self.config.hours_observation_sd.powi(2);
        let spread2 = self.config.exercise_spread_sd.powi(2);

        let mut by_exercise: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for obs in observations.iter().filter(|o| o.category == category) {
            if let Some(sample) = obs.hours_sample {
                by_exercise.entry(obs.exercise_id.as_str()).or_default().push(sample);
            }
        }

        let prior_precision = 1.0 / prior.std_dev.powi(2);
        let mut precision = prior_precision;
        let mut weighted = prior.mean * prior_precision;
        let mut samples = 0;

        for values in by_exercise.values() {
            let n = values.len() as f64;
            let exercise_mean = values.iter().mean();
            let variance = sigma2 / n + spread2;
            precision += 1.0 / variance;
            weighted += exercise_mean / variance;
            samples += values.len();
        }

        let posterior_mean = weighted / precision;
        let posterior_sd = (1.0 / precision).sqrt();
        let user = ParameterEstimate {
            prior_mean: prior.mean,
            posterior_mean,
            posterior_sd,
            shrinkage: prior_precision / precision,
            samples,
            credible_interval: credible_interval(posterior_mean, posterior_sd),
        };

        // Exercise estimates shrink toward the user posterior
        let exercises = by_exercise
            .into_iter()
            .map(|(exercise_id, values)| {
                let n = values.len() as f64;
                let sample_mean = values.iter().mean();
                let sample_sd = if values.len() > 1 {
                    Some(values.iter().std_dev())
                } else {
                    None
                };
                let pooled_mean = (posterior_mean / spread2 + n * sample_mean / sigma2)
                    / (1.0 / spread2 + n / sigma2);

                ExerciseEstimate {
                    exercise_id: exercise_id.to_string(),
                    category,
                    samples: values.len(),
                    sample_mean,
                    sample_sd,
                    pooled_mean,
                }
            })
            .collect();

        (user, exercises)
    }
}

/// Gaussian conjugate update of a prior with i.i.d. samples
fn conjugate_update(prior: NormalPrior, observation_sd: f64, samples: &[f64]) -> ParameterEstimate {
    let prior_precision = 1.0 / prior.std_dev.powi(2);
    let data_precision = samples.len() as f64 / observation_sd.powi(2);
    let precision = prior_precision + data_precision;

    let data_sum: f64 = samples.iter().sum();
    let posterior_mean =
        (prior.mean * prior_precision + data_sum / observation_sd.powi(2)) / precision;
    let posterior_sd = (1.0 / precision).sqrt();

    ParameterEstimate {
        prior_mean: prior.mean,
        posterior_mean,
        posterior_sd,
        shrinkage: prior_precision / precision,
        samples: samples.len(),
        credible_interval: credible_interval(posterior_mean, posterior_sd),
    }
}

fn credible_interval(mean: f64, sd: f64) -> Option<(f64, f64)> {
    let normal = Normal::new(mean, sd).ok()?;
    Some((normal.inverse_cdf(0.025), normal.inverse_cdf(0.975)))
}

/// Runs calibration off the request path, one run per user at a time
pub struct CalibrationService<S: EventStore + 'static> {
    store: Arc<S>,
    calibrator: Calibrator,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: EventStore + 'static> CalibrationService<S> {
    pub fn new(store: Arc<S>, calibrator: Calibrator) -> Self {
        CalibrationService {
            store,
            calibrator,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Schedule a run after a completed session
    ///
    /// Must be called from within a tokio runtime. Failures are logged as
    /// stale calibration and never surface to the caller.
    pub fn on_session_completed(&self, user_id: &str) -> tokio::task::JoinHandle<CalibrationOutcome> {
        let store = Arc::clone(&self.store);
        let calibrator = self.calibrator.clone();
        let lock = self.user_lock(user_id);
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let user = user_id.clone();

            let result = tokio::task::spawn_blocking(move || {
                run_calibration(store.as_ref(), &calibrator, &user, Utc::now())
            })
            .await
            .map_err(|e| EngineError::Internal(format!("calibration task failed: {}", e)))
            .and_then(|r| r);

            match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    let stale = EngineError::CalibrationStale(e.to_string());
                    warn!(user_id = %user_id, error = %stale, "Calibration did not run");
                    CalibrationOutcome::Stale {
                        reason: e.to_string(),
                    }
                }
            }
        })
    }

    /// Run immediately, still serialized with scheduled runs
    pub async fn calibrate_now(&self, user_id: &str) -> Result<CalibrationOutcome> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let store = Arc::clone(&self.store);
        let calibrator = self.calibrator.clone();
        let user = user_id.to_string();

        tokio::task::spawn_blocking(move || run_calibration(store.as_ref(), &calibrator, &user, Utc::now()))
            .await
            .map_err(|e| EngineError::Internal(format!("calibration task failed: {}", e)))?
    }
}

/// Fetch, calibrate and persist for one user
pub fn run_calibration<S: EventStore + ?Sized>(
    store: &S,
    calibrator: &Calibrator,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<CalibrationOutcome> {
    let from = now - Duration::days(calibrator.config().lookback_days as i64);
    let events = store.fetch_training_events(user_id, from, now)?;
    let current = store.fetch_recovery_parameters(user_id)?;

    let outcome = calibrator.calibrate(&events, &current, now);

    if let CalibrationOutcome::Updated(report) = &outcome {
        store.persist_recovery_parameters(user_id, &report.parameters)?;
        info!(
            user_id,
            sessions = report.sessions,
            observations = report.observations,
            upper_hours = report.parameters.upper_recovery_hours,
            lower_hours = report.parameters.lower_recovery_hours,
            fatigue_resistance = report.parameters.fatigue_resistance,
            confidence = report.parameters.confidence,
            "Recovery parameters calibrated"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MuscleGroup;
    use crate::store::InMemoryEventStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn bench(index: i64, load: Decimal) -> TrainingEvent {
        TrainingEvent::new(
            "user_1",
            format!("session_{}", index),
            "bench_press",
            start() + Duration::hours(index * 36),
            [MuscleGroup::Chest, MuscleGroup::Triceps],
            4,
            5,
            load,
            Some(8.0),
        )
        .unwrap()
    }

    /// Bench every 36 hours with the weight holding up better than the model expects
    fn resilient_history(sessions: i64) -> Vec<TrainingEvent> {
        (0..sessions)
            .map(|i| bench(i, dec!(200) + Decimal::from(i)))
            .collect()
    }

    #[test]
    fn test_confidence_is_monotone_and_bounded() {
        let calibrator = Calibrator::new();
        let mut previous = -1.0;
        for sessions in 0..200 {
            let c = calibrator.confidence(sessions);
            assert!(c > previous);
            assert!(c < 1.0);
            previous = c;
        }
        assert!((calibrator.confidence(10) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_skipped_below_min_sessions() {
        let calibrator = Calibrator::new();
        let params = RecoveryParameters::population_default();
        let events = resilient_history(2);

        match calibrator.calibrate(&events, &params, start() + Duration::days(5)) {
            CalibrationOutcome::Skipped { sessions, required } => {
                assert_eq!(sessions, 2);
                assert_eq!(required, 3);
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_observation_prediction() {
        let calibrator = Calibrator::new();
        let params = RecoveryParameters::population_default();
        let events = resilient_history(2);

        let observations = calibrator.observations(&events, &params);
        assert_eq!(observations.len(), 1);

        let obs = &observations[0];
        assert_eq!(obs.category, MuscleCategory::Upper);
        assert!(obs.prior_fatigue > 0.0 && obs.prior_fatigue < 80.0);
        assert!((obs.observed_ratio - 201.0 / 200.0).abs() < 1e-9);
        assert!(obs.error > 0.0);
        assert!(obs.hours_sample.unwrap() < params.upper_recovery_hours);
    }

    #[test]
    fn test_fast_recoverer_shrinks_toward_data() {
        let calibrator = Calibrator::new();
        let params = RecoveryParameters::population_default();
        let now = start() + Duration::days(40);

        let few = match calibrator.calibrate(&resilient_history(4), &params, now) {
            CalibrationOutcome::Updated(report) => report,
            other => panic!("expected update, got {:?}", other),
        };
        let many = match calibrator.calibrate(&resilient_history(24), &params, now) {
            CalibrationOutcome::Updated(report) => report,
            other => panic!("expected update, got {:?}", other),
        };

        // More evidence moves further from the prior and trusts it less
        assert!(few.parameters.upper_recovery_hours < 48.0);
        assert!(many.parameters.upper_recovery_hours < few.parameters.upper_recovery_hours);
        assert!(many.upper_hours.shrinkage < few.upper_hours.shrinkage);
        assert!(many.parameters.confidence > few.parameters.confidence);

        // Nothing observed for the lower body: posterior is the prior
        assert_eq!(many.lower_hours.samples, 0);
        assert!((many.parameters.lower_recovery_hours - 72.0).abs() < 1e-9);
        assert!((many.lower_hours.shrinkage - 1.0).abs() < 1e-12);

        let (low, high) = many.upper_hours.credible_interval.unwrap();
        assert!(low < many.upper_hours.posterior_mean && many.upper_hours.posterior_mean < high);
        assert_eq!(many.exercises.len(), 1);
    }

    #[test]
    fn test_conjugate_update_without_samples_is_prior() {
        let estimate = conjugate_update(NormalPrior::new(50.0, 15.0), 25.0, &[]);
        assert!((estimate.posterior_mean - 50.0).abs() < 1e-9);
        assert!((estimate.posterior_sd - 15.0).abs() < 1e-9);
        assert!((estimate.shrinkage - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_conjugate_update_pulls_toward_samples() {
        let estimate = conjugate_update(NormalPrior::new(50.0, 15.0), 25.0, &[80.0; 10]);
        assert!(estimate.posterior_mean > 50.0 && estimate.posterior_mean < 80.0);
        assert!(estimate.shrinkage < 0.5);
    }

    #[test]
    fn test_run_calibration_persists() {
        let store = InMemoryEventStore::new();
        store.append_training_events(&resilient_history(6)).unwrap();
        let now = start() + Duration::days(20);

        let outcome = run_calibration(&store, &Calibrator::new(), "user_1", now).unwrap();
        assert!(matches!(outcome, CalibrationOutcome::Updated(_)));

        let stored = store.fetch_recovery_parameters("user_1").unwrap();
        assert_eq!(stored.session_count, 6);
        assert_eq!(stored.last_calibrated_at, Some(now));
    }

    #[test]
    fn test_confidence_survives_sliding_window() {
        let store = InMemoryEventStore::new();
        let history: Vec<TrainingEvent> = (0..40)
            .map(|i| TrainingEvent {
                timestamp: start() + Duration::days(i * 5),
                ..bench(i, dec!(200) + Decimal::from(i))
            })
            .collect();
        store.append_training_events(&history).unwrap();
        let calibrator = Calibrator::new();

        run_calibration(&store, &calibrator, "user_1", start() + Duration::days(200)).unwrap();
        let early = store.fetch_recovery_parameters("user_1").unwrap();
        assert_eq!(early.session_count, 36);

        // Only four sessions remain inside the lookback window by day 360
        let outcome = run_calibration(&store, &calibrator, "user_1", start() + Duration::days(360)).unwrap();
        match outcome {
            CalibrationOutcome::Updated(report) => assert_eq!(report.sessions, 4),
            other => panic!("expected update, got {:?}", other),
        }
        let late = store.fetch_recovery_parameters("user_1").unwrap();
        assert_eq!(late.session_count, 36);
        assert!(late.confidence >= early.confidence);
        assert!(late.confidence >= 0.5);
    }

    #[test]
    fn test_cumulative_sessions_add_only_new_sessions() {
        let calibrator = Calibrator::new();
        let events = resilient_history(6);

        let fresh = RecoveryParameters::population_default();
        assert_eq!(calibrator.cumulative_sessions(&events, &fresh), 6);

        // Calibrated after the third session, with ten sessions counted before the window
        let mut seen = RecoveryParameters::population_default();
        seen.session_count = 10;
        seen.last_calibrated_at = Some(events[2].timestamp);
        assert_eq!(calibrator.cumulative_sessions(&events, &seen), 13);
    }

    #[tokio::test]
    async fn test_service_reports_stale_on_failure() {
        let store = Arc::new(InMemoryEventStore::new());
        store.append_training_events(&resilient_history(6)).unwrap();
        store.set_unavailable(true);

        let service = CalibrationService::new(Arc::clone(&store), Calibrator::new());
        let outcome = service.on_session_completed("user_1").await.unwrap();
        assert!(matches!(outcome, CalibrationOutcome::Stale { .. }));

        // Last-known parameters remain readable once the store recovers
        store.set_unavailable(false);
        let params = store.fetch_recovery_parameters("user_1").unwrap();
        assert!(!params.is_calibrated());
    }
}
