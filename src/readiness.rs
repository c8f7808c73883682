//! Readiness orchestration
//!
//! [`ReadinessEngine`] merges the workload ratio, the fitness-fatigue state,
//! per-muscle recovery and optional context data into one
//! [`ReadinessSnapshot`] per user and hour.
//!
//! # Score
//!
//! ```text
//! score = base + form_weight × form
//!       − acwr_penalty(zone)
//!       − min(muscle_cap, per_point × Σ muscle fatigue)
//!       − context_penalty
//! ```
//!
//! clamped to [0, 100], where `form = (fitness − fatigue) / (fitness + fatigue)`.
//!
//! # Failure policy
//!
//! The readiness path never returns an error. Missing context data is
//! skipped, an empty history yields a no-history snapshot, and a slow or
//! failing store falls back to the newest cached snapshot.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{hour_key, CachedReadiness, SnapshotCache};
use crate::calibration::{CalibrationOutcome, CalibrationService, Calibrator};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fitness_fatigue::{FatiguePoint, FatigueState, FitnessFatigueModel};
use crate::models::{ContextSample, MuscleCategory, MuscleGroup, RecoveryParameters, TrainingEvent};
use crate::muscle::{MuscleRecoveryState, MuscleRecoveryTracker, RecoveryStatus};
use crate::sfr::{ExerciseEfficiency, SfrAnalyzer};
use crate::store::{day_start, EventAdapter, EventStore, LoggedSetRecord};
use crate::workload::{AcwrCalculator, DailyLoad, RiskZone, WorkloadWindow};

/// Score weights, penalties and load deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub base_score: f64,

    /// Points added per unit of form
    pub form_weight: f64,

    pub undertraining_penalty: f64,
    pub optimal_penalty: f64,
    pub caution_penalty: f64,
    pub high_risk_penalty: f64,

    /// Points per summed muscle-fatigue point
    pub muscle_penalty_per_point: f64,
    pub muscle_penalty_cap: f64,

    pub sleep_target_hours: f64,
    pub sleep_penalty_per_hour: f64,
    pub stress_neutral: u8,
    pub stress_penalty_per_point: f64,
    pub soreness_neutral: u8,
    pub soreness_penalty_per_point: f64,

    /// Quality ratings (higher is better) are penalised below their neutral point
    pub sleep_quality_neutral: u8,
    pub sleep_quality_penalty_per_point: f64,
    pub nutrition_neutral: u8,
    pub nutrition_penalty_per_point: f64,

    /// Recommended load change in percent per zone
    pub high_risk_delta_pct: i8,
    pub caution_delta_pct: i8,
    pub optimal_delta_pct: i8,
    pub undertraining_delta_pct: i8,

    /// Share of mean category fatigue taken off that category's load
    pub category_modifier_weight: f64,
    pub min_category_modifier: f64,

    /// Performance baseline for the fitness-fatigue model
    pub performance_baseline: f64,

    /// History replayed when no cached state is available
    pub history_days: u32,

    /// History fetched when resuming from a cached state
    pub recent_window_days: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            base_score: 50.0,
            form_weight: 30.0,
            undertraining_penalty: 5.0,
            optimal_penalty: 0.0,
            caution_penalty: 10.0,
            high_risk_penalty: 25.0,
            muscle_penalty_per_point: 0.1,
            muscle_penalty_cap: 30.0,
            sleep_target_hours: 7.0,
            sleep_penalty_per_hour: 3.0,
            stress_neutral: 5,
            stress_penalty_per_point: 1.0,
            soreness_neutral: 5,
            soreness_penalty_per_point: 1.0,
            sleep_quality_neutral: 5,
            sleep_quality_penalty_per_point: 1.0,
            nutrition_neutral: 5,
            nutrition_penalty_per_point: 0.5,
            high_risk_delta_pct: -20,
            caution_delta_pct: -10,
            optimal_delta_pct: 5,
            undertraining_delta_pct: 10,
            category_modifier_weight: 0.5,
            min_category_modifier: 0.5,
            performance_baseline: 0.0,
            history_days: 120,
            recent_window_days: 35,
        }
    }
}

impl ReadinessConfig {
    pub fn acwr_penalty(&self, zone: RiskZone) -> f64 {
        match zone {
            RiskZone::InsufficientData => 0.0,
            RiskZone::Undertraining => self.undertraining_penalty,
            RiskZone::Optimal => self.optimal_penalty,
            RiskZone::Caution => self.caution_penalty,
            RiskZone::HighRisk => self.high_risk_penalty,
        }
    }

    pub fn load_delta_pct(&self, zone: RiskZone) -> i8 {
        match zone {
            RiskZone::InsufficientData => 0,
            RiskZone::Undertraining => self.undertraining_delta_pct,
            RiskZone::Optimal => self.optimal_delta_pct,
            RiskZone::Caution => self.caution_delta_pct,
            RiskZone::HighRisk => self.high_risk_delta_pct,
        }
    }

    /// Penalty from the day's context ratings; absent fields contribute nothing
    pub fn context_penalty(&self, sample: &ContextSample) -> f64 {
        let mut penalty = 0.0;

        if let Some(hours) = sample.sleep_hours {
            penalty += (self.sleep_target_hours - hours).max(0.0) * self.sleep_penalty_per_hour;
        }
        if let Some(stress) = sample.stress {
            penalty += stress.saturating_sub(self.stress_neutral) as f64 * self.stress_penalty_per_point;
        }
        if let Some(soreness) = sample.soreness {
            penalty +=
                soreness.saturating_sub(self.soreness_neutral) as f64 * self.soreness_penalty_per_point;
        }
        if let Some(quality) = sample.sleep_quality {
            penalty += self.sleep_quality_neutral.saturating_sub(quality) as f64
                * self.sleep_quality_penalty_per_point;
        }
        if let Some(nutrition) = sample.nutrition_quality {
            penalty += self.nutrition_neutral.saturating_sub(nutrition) as f64 * self.nutrition_penalty_per_point;
        }

        penalty
    }

    /// Load multiplier for a category from its mean fatigue
    pub fn category_modifier(&self, mean_fatigue: f64) -> f64 {
        (1.0 - self.category_modifier_weight * mean_fatigue / 100.0).clamp(self.min_category_modifier, 1.0)
    }
}

/// Additive parts of a readiness score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub form_contribution: f64,
    pub acwr_penalty: f64,
    pub muscle_penalty: f64,
    pub context_penalty: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.base + self.form_contribution
            - self.acwr_penalty
            - self.muscle_penalty
            - self.context_penalty
    }

    pub fn score(&self) -> u8 {
        self.total().clamp(0.0, 100.0).round() as u8
    }
}

/// Orchestrator output for one user at one hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    pub user_id: String,

    /// Evaluation time (a whole hour)
    pub as_of: DateTime<Utc>,

    /// 0-100; `None` when there is no training history
    pub score: Option<u8>,

    /// Overall zone, escalated for unrecovered muscles
    pub zone: RiskZone,

    /// Zone from the workload ratio alone
    pub acwr_zone: RiskZone,

    pub acwr_ratio: Option<f64>,
    pub acute_load: f64,
    pub chronic_load: f64,

    /// Recommended change to next-session load, in percent
    pub load_delta_pct: i8,

    /// Load multiplier per body region
    pub category_modifiers: BTreeMap<MuscleCategory, f64>,

    pub muscles: Vec<MuscleRecoveryState>,

    pub fitness: f64,
    pub fatigue: f64,
    pub performance: f64,

    pub breakdown: Option<ScoreBreakdown>,

    /// Served from a fallback because the store could not be read
    pub degraded: bool,

    pub computed_at: DateTime<Utc>,
}

impl ReadinessSnapshot {
    /// Well-defined result for a user with no training history
    pub fn no_history(user_id: &str, as_of: DateTime<Utc>) -> Self {
        ReadinessSnapshot {
            user_id: user_id.to_string(),
            as_of,
            score: None,
            zone: RiskZone::InsufficientData,
            acwr_zone: RiskZone::InsufficientData,
            acwr_ratio: None,
            acute_load: 0.0,
            chronic_load: 0.0,
            load_delta_pct: 0,
            category_modifiers: neutral_modifiers(),
            muscles: Vec::new(),
            fitness: 0.0,
            fatigue: 0.0,
            performance: 0.0,
            breakdown: None,
            degraded: false,
            computed_at: Utc::now(),
        }
    }

    /// No-history shape returned when the store failed and nothing was cached
    pub fn degraded(user_id: &str, as_of: DateTime<Utc>) -> Self {
        ReadinessSnapshot {
            degraded: true,
            ..Self::no_history(user_id, as_of)
        }
    }

    pub fn has_history(&self) -> bool {
        self.score.is_some()
    }
}

fn neutral_modifiers() -> BTreeMap<MuscleCategory, f64> {
    [(MuscleCategory::Upper, 1.0), (MuscleCategory::Lower, 1.0)]
        .into_iter()
        .collect()
}

/// Store reads needed for one evaluation
#[derive(Debug, Clone)]
pub struct ReadinessInputs {
    pub params: RecoveryParameters,
    pub events: Vec<TrainingEvent>,
    pub context: Vec<ContextSample>,
}

/// Cached state an evaluation can resume from
#[derive(Debug, Clone, Copy)]
struct WarmStart {
    state: FatigueState,
    history_start: Option<DateTime<Utc>>,
}

/// Result of an ingestion call
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub events: usize,
    pub sessions: usize,
    pub users: Vec<String>,
    pub earliest: Option<DateTime<Utc>>,
}

/// Day-by-day load history for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTrend {
    pub user_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,

    /// One workload window per day, evaluated at the end of the day
    pub windows: Vec<WorkloadWindow>,

    /// Fitness-fatigue state sampled at the end of each day
    pub fitness: Vec<FatiguePoint>,

    /// Training volume of each day in the period that had any
    pub daily_loads: BTreeMap<NaiveDate, DailyLoad>,

    /// Days whose ratio reached the high-risk zone
    pub spike_days: usize,

    pub mean_ratio: Option<f64>,
}

impl LoadTrend {
    pub fn training_days(&self) -> usize {
        self.daily_loads.len()
    }

    /// Change in modelled performance from the first to the last day
    pub fn performance_change(&self) -> Option<f64> {
        match (self.fitness.first(), self.fitness.last()) {
            (Some(first), Some(last)) => Some(last.performance - first.performance),
            _ => None,
        }
    }
}

/// Pure evaluation of one snapshot from already-fetched inputs
#[derive(Debug, Clone, Default)]
pub struct ReadinessEvaluator {
    config: EngineConfig,
}

impl ReadinessEvaluator {
    pub fn new(config: EngineConfig) -> Self {
        ReadinessEvaluator { config }
    }

    fn model(&self, params: &RecoveryParameters) -> FitnessFatigueModel {
        FitnessFatigueModel::for_parameters(&self.config.banister, &self.config.impulse, params)
    }

    fn tracker(&self) -> MuscleRecoveryTracker {
        MuscleRecoveryTracker::with_config(self.config.muscle.clone())
    }

    /// Evaluate from full history
    pub fn evaluate(&self, user_id: &str, as_of: DateTime<Utc>, inputs: &ReadinessInputs) -> CachedReadiness {
        self.evaluate_from(user_id, as_of, inputs, None)
    }

    fn evaluate_from(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
        inputs: &ReadinessInputs,
        warm: Option<WarmStart>,
    ) -> CachedReadiness {
        let readiness = &self.config.readiness;
        let events: Vec<TrainingEvent> = inputs
            .events
            .iter()
            .filter(|e| e.timestamp <= as_of)
            .cloned()
            .collect();

        let history_start = match (warm.and_then(|w| w.history_start), events.first()) {
            (Some(known), Some(first)) => Some(known.min(first.timestamp)),
            (Some(known), None) => Some(known),
            (None, Some(first)) => Some(first.timestamp),
            (None, None) => None,
        };

        let model = self.model(&inputs.params);
        let state = match warm {
            Some(w) => model.advance(&w.state, &events, as_of),
            None => model.replay(&events, as_of),
        };

        if history_start.is_none() {
            debug!(user_id, %as_of, "No training history");
            return CachedReadiness {
                snapshot: ReadinessSnapshot::no_history(user_id, as_of),
                fatigue_state: Some(state),
                history_start: None,
            };
        }

        let acwr = AcwrCalculator::with_config(self.config.acwr.clone());
        let window = acwr.compute_acwr_with_origin(&events, as_of, history_start);

        let tracker = self.tracker();
        let muscles = tracker.states_at(&events, as_of, &inputs.params);

        let context = context_for(&inputs.context, as_of.date_naive());
        let breakdown = ScoreBreakdown {
            base: readiness.base_score,
            form_contribution: readiness.form_weight * state.form(),
            acwr_penalty: readiness.acwr_penalty(window.zone),
            muscle_penalty: (readiness.muscle_penalty_per_point
                * muscles.iter().map(|m| m.fatigue_level).sum::<f64>())
            .min(readiness.muscle_penalty_cap),
            context_penalty: context.map(|c| readiness.context_penalty(c)).unwrap_or(0.0),
        };

        let zone = escalate(window.zone, &muscles);
        let category_modifiers = self.category_modifiers(&muscles);
        let score = breakdown.score();

        debug!(
            user_id,
            %as_of,
            score,
            zone = %zone,
            acwr_zone = %window.zone,
            fitness = state.fitness,
            fatigue = state.fatigue,
            "Computed readiness"
        );

        CachedReadiness {
            snapshot: ReadinessSnapshot {
                user_id: user_id.to_string(),
                as_of,
                score: Some(score),
                zone,
                acwr_zone: window.zone,
                acwr_ratio: window.ratio.and_then(|r| r.to_f64()),
                acute_load: window.acute.to_f64().unwrap_or(0.0),
                chronic_load: window.chronic.to_f64().unwrap_or(0.0),
                load_delta_pct: readiness.load_delta_pct(zone),
                category_modifiers,
                muscles,
                fitness: state.fitness,
                fatigue: state.fatigue,
                performance: state.performance(readiness.performance_baseline),
                breakdown: Some(breakdown),
                degraded: false,
                computed_at: Utc::now(),
            },
            fatigue_state: Some(state),
            history_start,
        }
    }

    fn category_modifiers(&self, muscles: &[MuscleRecoveryState]) -> BTreeMap<MuscleCategory, f64> {
        let means = MuscleRecoveryTracker::category_fatigue(muscles);
        let mut modifiers = neutral_modifiers();
        for (category, mean) in means {
            modifiers.insert(category, self.config.readiness.category_modifier(mean));
        }
        modifiers
    }

    /// Daily workload and fitness-fatigue history over `days` ending on `end`
    pub fn trend(&self, user_id: &str, end: NaiveDate, days: u32, inputs: &ReadinessInputs) -> LoadTrend {
        let start = end - Duration::days(days.saturating_sub(1) as i64);
        let acwr = AcwrCalculator::with_config(self.config.acwr.clone());

        let windows = acwr.acwr_series(&inputs.events, start, end);
        let spike_days = acwr.spike_days(&windows);
        let mean_ratio = acwr.mean_ratio(&windows);

        let in_period: Vec<TrainingEvent> = inputs
            .events
            .iter()
            .filter(|e| (start..=end).contains(&e.timestamp.date_naive()))
            .cloned()
            .collect();
        let daily_loads = acwr.aggregate_daily_loads(&in_period);

        let end_of_day = Duration::days(1) - Duration::seconds(1);
        let fitness = self.model(&inputs.params).series(
            &inputs.events,
            day_start(start) + end_of_day,
            day_start(end) + end_of_day,
            Duration::days(1),
            self.config.readiness.performance_baseline,
        );

        debug!(user_id, %start, %end, spike_days, "Computed load trend");

        LoadTrend {
            user_id: user_id.to_string(),
            start,
            end,
            windows,
            fitness,
            daily_loads,
            spike_days,
            mean_ratio,
        }
    }
}

/// Context sample for `date`, else the day before
fn context_for(samples: &[ContextSample], date: NaiveDate) -> Option<&ContextSample> {
    samples
        .iter()
        .find(|s| s.date == date)
        .or_else(|| date.pred_opt().and_then(|prev| samples.iter().find(|s| s.date == prev)))
}

/// Unrecovered muscles push a calm workload zone up to caution
fn escalate(zone: RiskZone, muscles: &[MuscleRecoveryState]) -> RiskZone {
    let unrecovered = muscles.iter().any(|m| m.status == RecoveryStatus::NotReady);
    match zone {
        RiskZone::InsufficientData => zone,
        z if unrecovered && z.severity() < RiskZone::Caution.severity() => RiskZone::Caution,
        other => other,
    }
}

fn fetch_inputs<S: EventStore + ?Sized>(
    store: &S,
    user_id: &str,
    from: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> Result<ReadinessInputs> {
    let params = store.fetch_recovery_parameters(user_id)?;
    let events = store.fetch_training_events(user_id, from, as_of)?;
    let today = as_of.date_naive();
    let context = store.fetch_context_samples(user_id, today.pred_opt().unwrap_or(today), today)?;

    Ok(ReadinessInputs {
        params,
        events,
        context,
    })
}

/// Readiness entry point shared by request handlers
pub struct ReadinessEngine<S: EventStore + 'static> {
    store: Arc<S>,
    cache: Arc<SnapshotCache>,
    evaluator: ReadinessEvaluator,
    calibration: CalibrationService<S>,
    config: EngineConfig,
}

impl<S: EventStore + 'static> ReadinessEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let calibrator = Calibrator::with_config(
            config.calibration.clone(),
            MuscleRecoveryTracker::with_config(config.muscle.clone()),
        );

        ReadinessEngine {
            calibration: CalibrationService::new(Arc::clone(&store), calibrator),
            cache: Arc::new(SnapshotCache::new(config.cache.clone())),
            evaluator: ReadinessEvaluator::new(config.clone()),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.fetch_timeout_ms)
    }

    /// Run a store call on the blocking pool under the fetch timeout
    async fn with_store<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        match tokio::time::timeout(self.fetch_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::Internal(format!("{} task failed: {}", operation, e))),
            Err(_) => Err(EngineError::UpstreamUnavailable(format!(
                "{} timed out after {} ms",
                operation, self.config.fetch_timeout_ms
            ))),
        }
    }

    /// Readiness for a user at `as_of` (default now), rounded up to the hour
    ///
    /// Never fails: store problems fall back to the newest cached snapshot,
    /// or to a degraded no-history snapshot when nothing is cached.
    pub async fn get_readiness(&self, user_id: &str, as_of: Option<DateTime<Utc>>) -> ReadinessSnapshot {
        let as_of = hour_key(as_of.unwrap_or_else(Utc::now));

        if let Some(hit) = self.cache.get(user_id, as_of) {
            debug!(user_id, %as_of, "Readiness cache hit");
            return hit.snapshot;
        }

        // Results computed across a concurrent write must not be stored
        let generation = self.cache.generation(user_id);

        match self.compute(user_id, as_of).await {
            Ok(cached) => {
                if self.cache.put_if_unchanged(user_id, cached.clone(), generation) {
                    self.persist_snapshot(user_id, cached.clone(), generation);
                }
                cached.snapshot
            }
            Err(e) => {
                warn!(
                    user_id,
                    %as_of,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Readiness fetch failed; using fallback"
                );
                self.fallback(user_id, as_of).await
            }
        }
    }

    async fn compute(&self, user_id: &str, as_of: DateTime<Utc>) -> Result<CachedReadiness> {
        let warm = self
            .cache
            .latest_at_or_before(user_id, as_of)
            .filter(|c| !c.snapshot.degraded)
            .and_then(|c| {
                c.fatigue_state.map(|state| WarmStart {
                    state,
                    history_start: c.history_start,
                })
            });

        let readiness = &self.config.readiness;
        let from = match warm {
            Some(w) => (as_of - Duration::days(readiness.recent_window_days as i64)).min(w.state.at),
            None => as_of - Duration::days(readiness.history_days as i64),
        };

        let user = user_id.to_string();
        let inputs = self
            .with_store("readiness fetch", move |store| fetch_inputs(store, &user, from, as_of))
            .await?;

        debug!(
            user_id,
            %as_of,
            events = inputs.events.len(),
            incremental = warm.is_some(),
            "Fetched readiness inputs"
        );

        Ok(self.evaluator.evaluate_from(user_id, as_of, &inputs, warm))
    }

    /// Best-effort background write of a fresh snapshot
    ///
    /// Writers bump the generation before touching the store, so a change
    /// seen after persisting means the row may predate that write and is
    /// removed again.
    fn persist_snapshot(&self, user_id: &str, cached: CachedReadiness, generation: u64) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let user = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            if cache.generation(&user) != generation {
                return;
            }
            let as_of = cached.snapshot.as_of;
            if let Err(e) = store.persist_readiness_snapshot(&user, &cached) {
                warn!(user_id = %user, error = %e, "Could not persist readiness snapshot");
                return;
            }
            if cache.generation(&user) != generation {
                if let Err(e) = store.drop_readiness_snapshots(&user, as_of) {
                    warn!(user_id = %user, error = %e, "Could not drop superseded snapshot");
                }
            }
        });
    }

    async fn fallback(&self, user_id: &str, as_of: DateTime<Utc>) -> ReadinessSnapshot {
        let cached = match self.cache.latest_at_or_before(user_id, as_of) {
            Some(cached) => Some(cached),
            None => {
                let user = user_id.to_string();
                self.with_store("snapshot fetch", move |store| store.fetch_cached_snapshot(&user, as_of))
                    .await
                    .unwrap_or_else(|e| {
                        debug!(user_id, error = %e, "No persisted snapshot available");
                        None
                    })
            }
        };

        match cached {
            Some(cached) => ReadinessSnapshot {
                degraded: true,
                ..cached.snapshot
            },
            None => ReadinessSnapshot::degraded(user_id, as_of),
        }
    }

    /// Recovery state of one muscle
    pub async fn get_muscle_recovery(
        &self,
        user_id: &str,
        muscle: MuscleGroup,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<MuscleRecoveryState> {
        let as_of = as_of.unwrap_or_else(Utc::now);
        let from = as_of - Duration::days(self.config.readiness.recent_window_days as i64);
        let user = user_id.to_string();

        let (params, events) = self
            .with_store("muscle fetch", move |store| {
                Ok((
                    store.fetch_recovery_parameters(&user)?,
                    store.fetch_training_events(&user, from, as_of)?,
                ))
            })
            .await?;

        Ok(self
            .evaluator
            .tracker()
            .state_at(&events, muscle, as_of, &params))
    }

    /// Causally-scoped efficiency of each exercise in a session, in temporal order
    pub async fn get_exercise_efficiency(&self, session_id: &str) -> Result<Vec<ExerciseEfficiency>> {
        let session = session_id.to_string();
        let lookback = Duration::days(self.config.readiness.recent_window_days as i64);

        let inputs = self
            .with_store("session fetch", move |store| {
                let events = store.fetch_session_events(&session)?;
                let first = match events.first() {
                    Some(first) => first.clone(),
                    None => return Ok(None),
                };
                let params = store.fetch_recovery_parameters(&first.user_id)?;
                let history =
                    store.fetch_training_events(&first.user_id, first.timestamp - lookback, first.timestamp)?;
                Ok(Some((events, history, params)))
            })
            .await?;

        let (session_events, history, params) = match inputs {
            Some(inputs) => inputs,
            None => return Ok(Vec::new()),
        };

        let analyzer = SfrAnalyzer::with_components(
            self.config.sfr.clone(),
            self.evaluator.model(&params),
            self.evaluator.tracker(),
        );
        Ok(analyzer.analyze_session(&history, &session_events, &params))
    }

    /// Daily workload and fitness-fatigue history over the `days` ending on the day of `as_of`
    pub async fn get_load_trend(
        &self,
        user_id: &str,
        as_of: Option<DateTime<Utc>>,
        days: u32,
    ) -> Result<LoadTrend> {
        let end = as_of.unwrap_or_else(Utc::now).date_naive();
        let lookback = days as i64 + self.config.readiness.history_days as i64;
        let from = day_start(end) - Duration::days(lookback);
        let to = day_start(end) + Duration::days(1);
        let user = user_id.to_string();

        let inputs = self
            .with_store("trend fetch", move |store| fetch_inputs(store, &user, from, to))
            .await?;

        Ok(self.evaluator.trend(user_id, end, days, &inputs))
    }

    /// Validate legacy records and store them
    ///
    /// Any invalid record rejects the whole batch.
    pub async fn ingest_session(&self, records: &[LoggedSetRecord]) -> Result<IngestSummary> {
        let events = EventAdapter::to_training_events(records)?;
        self.ingest_events(events).await
    }

    /// Store already-validated events and invalidate affected snapshots
    pub async fn ingest_events(&self, events: Vec<TrainingEvent>) -> Result<IngestSummary> {
        let mut earliest_by_user: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for event in &events {
            earliest_by_user
                .entry(event.user_id.clone())
                .and_modify(|ts| *ts = (*ts).min(event.timestamp))
                .or_insert(event.timestamp);
        }

        let summary = IngestSummary {
            events: events.len(),
            sessions: events
                .iter()
                .map(|e| e.session_id.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
            users: earliest_by_user.keys().cloned().collect(),
            earliest: earliest_by_user.values().min().copied(),
        };

        if events.is_empty() {
            return Ok(summary);
        }

        // Invalidate on both sides of the write so no reader can cache a result without it
        for (user_id, from) in &earliest_by_user {
            self.cache.invalidate_from(user_id, *from);
        }

        self.with_store("event append", move |store| store.append_training_events(&events))
            .await?;

        for (user_id, from) in &earliest_by_user {
            self.cache.invalidate_from(user_id, *from);
            if self.config.calibrate_on_ingest {
                self.schedule_calibration(user_id);
            }
        }

        info!(
            events = summary.events,
            sessions = summary.sessions,
            users = summary.users.len(),
            "Ingested training events"
        );
        Ok(summary)
    }

    pub async fn ingest_context(&self, sample: ContextSample) -> Result<()> {
        sample.validate()?;
        let user_id = sample.user_id.clone();
        let from = day_start(sample.date);

        self.cache.invalidate_from(&user_id, from);
        self.with_store("context append", move |store| store.append_context_sample(&sample))
            .await?;
        self.cache.invalidate_from(&user_id, from);
        Ok(())
    }

    /// Tombstone a session; returns how many events were hidden
    pub async fn delete_session(&self, session_id: &str) -> Result<usize> {
        let session = session_id.to_string();
        let visible = self
            .with_store("session fetch", move |store| store.fetch_session_events(&session))
            .await?;
        if let Some(first) = visible.first() {
            self.cache.invalidate_from(&first.user_id, first.timestamp);
        }

        let session = session_id.to_string();
        let hidden = self
            .with_store("session tombstone", move |store| store.tombstone_session(&session))
            .await?;

        if let Some(first) = hidden.iter().min_by_key(|e| e.timestamp) {
            self.cache.invalidate_from(&first.user_id, first.timestamp);
            if self.config.calibrate_on_ingest {
                self.schedule_calibration(&first.user_id);
            }
        }

        info!(session_id, hidden = hidden.len(), "Session deleted");
        Ok(hidden.len())
    }

    /// Queue a background calibration run; cached snapshots are dropped if parameters change
    pub fn schedule_calibration(&self, user_id: &str) -> tokio::task::JoinHandle<CalibrationOutcome> {
        let handle = self.calibration.on_session_completed(user_id);
        let cache = Arc::clone(&self.cache);
        let user = user_id.to_string();

        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => CalibrationOutcome::Stale {
                    reason: e.to_string(),
                },
            };
            if matches!(outcome, CalibrationOutcome::Updated(_)) {
                cache.invalidate_user(&user);
            }
            outcome
        })
    }

    /// Calibrate now and wait for the result
    pub async fn calibrate(&self, user_id: &str) -> Result<CalibrationOutcome> {
        let outcome = self.calibration.calibrate_now(user_id).await?;
        if matches!(outcome, CalibrationOutcome::Updated(_)) {
            self.cache.invalidate_user(user_id);
        }
        Ok(outcome)
    }

    /// Evaluate many users in parallel, bypassing the cache
    ///
    /// Synchronous; intended for batch reports rather than request paths.
    pub fn batch_readiness(&self, user_ids: &[String], as_of: DateTime<Utc>) -> Vec<(String, Result<ReadinessSnapshot>)> {
        let as_of = hour_key(as_of);
        let from = as_of - Duration::days(self.config.readiness.history_days as i64);

        user_ids
            .par_iter()
            .map(|user_id| {
                let snapshot = fetch_inputs(self.store.as_ref(), user_id, from, as_of)
                    .map(|inputs| self.evaluator.evaluate(user_id, as_of, &inputs).snapshot);
                (user_id.clone(), snapshot)
            })
            .collect()
    }
}
