use chrono::{DateTime, Duration, TimeZone, Utc};
use liftload::config::EngineConfig;
use liftload::models::{ContextSample, MuscleGroup, TrainingEvent};
use liftload::muscle::RecoveryStatus;
use liftload::readiness::ReadinessEngine;
use liftload::store::{EventStore, InMemoryEventStore, LoggedSetRecord};
use liftload::workload::RiskZone;
use liftload::{CalibrationOutcome, EngineError};
use rust_decimal_macros::dec;
use std::sync::Arc;

/// End-to-end readiness workflows against the in-memory store

fn day(d: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::days(d)
}

fn evening(d: i64) -> DateTime<Utc> {
    day(d) + Duration::hours(8)
}

fn chest_press(user: &str, d: i64, sets: u32) -> TrainingEvent {
    TrainingEvent::new(
        user,
        format!("{}_day_{}", user, d),
        "machine_press",
        day(d),
        [MuscleGroup::Chest],
        sets,
        10,
        dec!(100),
        Some(6.0),
    )
    .unwrap()
}

fn engine_with(store: Arc<InMemoryEventStore>, config: EngineConfig) -> ReadinessEngine<InMemoryEventStore> {
    ReadinessEngine::new(store, config)
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        calibrate_on_ingest: false,
        ..EngineConfig::default()
    }
}

fn seeded_store(user: &str, days: std::ops::Range<i64>, sets: impl Fn(i64) -> u32) -> Arc<InMemoryEventStore> {
    let store = Arc::new(InMemoryEventStore::new());
    let events: Vec<TrainingEvent> = days.map(|d| chest_press(user, d, sets(d))).collect();
    store.append_training_events(&events).unwrap();
    store
}

#[tokio::test]
async fn test_unknown_user_gets_no_history_snapshot() {
    let engine = engine_with(Arc::new(InMemoryEventStore::new()), quiet_config());

    let snapshot = engine.get_readiness("nobody", Some(evening(0))).await;

    assert_eq!(snapshot.score, None);
    assert_eq!(snapshot.zone, RiskZone::InsufficientData);
    assert!(!snapshot.degraded);
    assert!(snapshot.muscles.is_empty());
}

#[tokio::test]
async fn test_steady_training_is_optimal() {
    let store = seeded_store("steady", 0..30, |_| 2);
    let engine = engine_with(store, quiet_config());

    let snapshot = engine.get_readiness("steady", Some(evening(29))).await;

    assert_eq!(snapshot.acwr_zone, RiskZone::Optimal);
    assert_eq!(snapshot.zone, RiskZone::Optimal);
    assert_eq!(snapshot.load_delta_pct, 5);
    assert!((snapshot.acwr_ratio.unwrap() - 1.0).abs() < 1e-9);

    let chest = &snapshot.muscles[0];
    assert_eq!(chest.muscle, MuscleGroup::Chest);
    assert_eq!(chest.status, RecoveryStatus::PartiallyRecovered);
    assert!(snapshot.score.is_some());
}

#[tokio::test]
async fn test_load_spike_is_high_risk() {
    // Three weeks at 2 sets, then a week at 6 sets
    let store = seeded_store("spiky", 0..28, |d| if d >= 21 { 6 } else { 2 });
    let engine = engine_with(store, quiet_config());

    let snapshot = engine.get_readiness("spiky", Some(evening(27))).await;

    assert_eq!(snapshot.acwr_zone, RiskZone::HighRisk);
    assert_eq!(snapshot.zone, RiskZone::HighRisk);
    assert_eq!(snapshot.load_delta_pct, -20);
    assert!(snapshot.acwr_ratio.unwrap() >= 1.5);
}

#[tokio::test]
async fn test_unrecovered_muscle_escalates_optimal_to_caution() {
    let store = seeded_store("sore", 0..30, |_| 2);
    let engine = engine_with(Arc::clone(&store), quiet_config());

    // A heavy session an hour before evaluation, light enough not to move the ratio much
    let heavy = TrainingEvent::new(
        "sore",
        "sore_heavy",
        "dumbbell_fly",
        day(29) + Duration::hours(7),
        [MuscleGroup::Chest],
        5,
        1,
        dec!(20),
        Some(9.0),
    )
    .unwrap();
    engine.ingest_events(vec![heavy]).await.unwrap();

    let snapshot = engine.get_readiness("sore", Some(evening(29))).await;

    assert_eq!(snapshot.acwr_zone, RiskZone::Optimal);
    assert_eq!(snapshot.zone, RiskZone::Caution);
    assert_eq!(snapshot.load_delta_pct, -10);
    assert_eq!(snapshot.muscles[0].status, RecoveryStatus::NotReady);
}

#[tokio::test]
async fn test_incremental_evaluation_matches_full_replay() {
    let store = seeded_store("warm", 0..30, |d| 2 + (d % 3) as u32);

    let warm_engine = engine_with(Arc::clone(&store), quiet_config());
    warm_engine.get_readiness("warm", Some(evening(20))).await;
    let warm = warm_engine.get_readiness("warm", Some(evening(29))).await;

    let cold_engine = engine_with(store, quiet_config());
    let cold = cold_engine.get_readiness("warm", Some(evening(29))).await;

    assert!((warm.fitness - cold.fitness).abs() < 1e-6);
    assert!((warm.fatigue - cold.fatigue).abs() < 1e-6);
    assert_eq!(warm.score, cold.score);
    assert_eq!(warm.zone, cold.zone);
    assert_eq!(warm.acwr_ratio, cold.acwr_ratio);
}

#[tokio::test]
async fn test_cache_hit_and_forward_invalidation() {
    let store = seeded_store("cached", 0..20, |_| 2);
    let engine = engine_with(store, quiet_config());

    let early = engine.get_readiness("cached", Some(evening(10))).await;
    let before = engine.get_readiness("cached", Some(evening(19))).await;
    let again = engine.get_readiness("cached", Some(evening(19) - Duration::minutes(30))).await;
    assert_eq!(before, again);
    assert_eq!(engine.cache().stats().hits, 1);

    // Late-arriving event earlier on day 19
    let late = chest_press("cached", 19, 5).with_id("late");
    let late = TrainingEvent {
        timestamp: day(19) + Duration::hours(2),
        session_id: "late_session".to_string(),
        ..late
    };
    engine.ingest_events(vec![late]).await.unwrap();

    let after = engine.get_readiness("cached", Some(evening(19))).await;
    assert!(after.fatigue > before.fatigue);

    let untouched = engine.get_readiness("cached", Some(evening(10))).await;
    assert_eq!(untouched, early);
}

#[tokio::test]
async fn test_ingest_session_from_records() {
    let store = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(Arc::clone(&store), quiet_config());

    let records: Vec<LoggedSetRecord> = ["bench_press", "incline_press"]
        .iter()
        .enumerate()
        .map(|(i, exercise)| LoggedSetRecord {
            id: None,
            user_id: "lifter".to_string(),
            session_id: "s1".to_string(),
            exercise_id: exercise.to_string(),
            performed_at: format!("2024-02-01T10:{:02}:00Z", i * 20),
            metadata: r#"{"schema_version":2,"sets":4,"reps":8,"weight":"80","rpe":8,"muscles":["chest","triceps"]}"#
                .to_string(),
        })
        .collect();

    let summary = engine.ingest_session(&records).await.unwrap();
    assert_eq!(summary.events, 2);
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.users, vec!["lifter".to_string()]);
    assert_eq!(store.event_count(), 2);

    let efficiencies = engine.get_exercise_efficiency("s1").await.unwrap();
    assert_eq!(efficiencies.len(), 2);
    assert_eq!(efficiencies[0].exercise_id, "bench_press");
    assert_eq!(efficiencies[1].exercise_id, "incline_press");
    assert!(efficiencies[1].fatigue_cost > efficiencies[0].fatigue_cost);
    assert!(efficiencies[1].sfr < efficiencies[0].sfr);
}

#[tokio::test]
async fn test_invalid_record_rejects_whole_batch() {
    let store = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(Arc::clone(&store), quiet_config());

    let good = LoggedSetRecord {
        id: None,
        user_id: "lifter".to_string(),
        session_id: "s1".to_string(),
        exercise_id: "row".to_string(),
        performed_at: "2024-02-01T10:00:00Z".to_string(),
        metadata: r#"{"schema_version":1,"sets":3,"reps":10,"weight":60,"muscles":["back"]}"#.to_string(),
    };
    let bad = LoggedSetRecord {
        metadata: r#"{"schema_version":1,"sets":-3,"reps":10,"weight":60,"muscles":["back"]}"#.to_string(),
        ..good.clone()
    };

    let result = engine.ingest_session(&[good, bad]).await;
    assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
    assert_eq!(store.event_count(), 0);
}

#[tokio::test]
async fn test_efficiency_for_unknown_session_is_empty() {
    let engine = engine_with(Arc::new(InMemoryEventStore::new()), quiet_config());
    assert!(engine.get_exercise_efficiency("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_context_lowers_score() {
    let store = seeded_store("ctx", 0..30, |_| 2);
    let engine = engine_with(store, quiet_config());

    let rested = engine.get_readiness("ctx", Some(evening(29))).await;

    let mut sample = ContextSample::empty("ctx", day(29).date_naive());
    sample.sleep_hours = Some(4.0);
    sample.stress = Some(9);
    engine.ingest_context(sample).await.unwrap();

    let tired = engine.get_readiness("ctx", Some(evening(29))).await;
    assert!(tired.score.unwrap() < rested.score.unwrap());
    assert!(tired.breakdown.unwrap().context_penalty > 0.0);
}

#[tokio::test]
async fn test_delete_session_removes_its_fatigue() {
    let store = seeded_store("del", 0..10, |_| 2);
    let engine = engine_with(store, quiet_config());

    let with_session = engine.get_readiness("del", Some(evening(9))).await;
    let hidden = engine.delete_session("del_day_9").await.unwrap();
    assert_eq!(hidden, 1);

    let without = engine.get_readiness("del", Some(evening(9))).await;
    assert!(without.fatigue < with_session.fatigue);
}

#[tokio::test]
async fn test_single_muscle_query() {
    let store = seeded_store("m", 0..3, |_| 4);
    let engine = engine_with(store, quiet_config());

    let chest = engine
        .get_muscle_recovery("m", MuscleGroup::Chest, Some(day(2)))
        .await
        .unwrap();
    assert!(chest.fatigue_level > 0.0);

    let quads = engine
        .get_muscle_recovery("m", MuscleGroup::Quadriceps, Some(day(2)))
        .await
        .unwrap();
    assert_eq!(quads.fatigue_level, 0.0);
    assert_eq!(quads.status, RecoveryStatus::Ready);
}

#[tokio::test]
async fn test_slow_store_falls_back_to_cached_snapshot() {
    let store = seeded_store("slow", 0..30, |_| 2);
    let config = EngineConfig {
        fetch_timeout_ms: 50,
        ..quiet_config()
    };
    let engine = engine_with(Arc::clone(&store), config);

    let fresh = engine.get_readiness("slow", Some(evening(28))).await;
    assert!(!fresh.degraded);

    store.set_fetch_latency(std::time::Duration::from_millis(300));
    let fallback = engine.get_readiness("slow", Some(evening(29))).await;

    assert!(fallback.degraded);
    assert_eq!(fallback.as_of, fresh.as_of);
    assert_eq!(fallback.score, fresh.score);
}

#[tokio::test]
async fn test_unavailable_store_without_cache_is_degraded() {
    let store = seeded_store("down", 0..5, |_| 2);
    store.set_unavailable(true);
    let engine = engine_with(store, quiet_config());

    let snapshot = engine.get_readiness("down", Some(evening(4))).await;
    assert!(snapshot.degraded);
    assert_eq!(snapshot.score, None);
}

#[tokio::test]
async fn test_calibrate_skips_short_history() {
    let store = seeded_store("new", 0..2, |_| 2);
    let engine = engine_with(store, quiet_config());

    let outcome = engine.calibrate("new").await.unwrap();
    assert!(matches!(outcome, CalibrationOutcome::Skipped { .. }));
}

#[tokio::test]
async fn test_batch_readiness_covers_every_user() {
    let store = Arc::new(InMemoryEventStore::new());
    for user in ["a", "b", "c"] {
        let events: Vec<TrainingEvent> = (0..30).map(|d| chest_press(user, d, 2)).collect();
        store.append_training_events(&events).unwrap();
    }
    let engine = engine_with(Arc::clone(&store), quiet_config());

    let users = store.list_users().unwrap();
    let results = engine.batch_readiness(&users, evening(29));

    assert_eq!(results.len(), 3);
    for (_, snapshot) in results {
        assert_eq!(snapshot.unwrap().zone, RiskZone::Optimal);
    }
}

#[tokio::test]
async fn test_write_during_fetch_is_not_cached_stale() {
    let store = seeded_store("racy", 0..20, |_| 2);
    let engine = engine_with(Arc::clone(&store), quiet_config());
    store.set_fetch_latency(std::time::Duration::from_millis(200));

    let late = TrainingEvent {
        timestamp: day(19) + Duration::hours(2),
        session_id: "racy_late".to_string(),
        ..chest_press("racy", 19, 6)
    };

    // The event lands after the readiness fetch read the history
    let (during, ingested) = tokio::join!(engine.get_readiness("racy", Some(evening(19))), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        engine.ingest_events(vec![late]).await
    });
    ingested.unwrap();
    assert!(!during.degraded);

    store.set_fetch_latency(std::time::Duration::ZERO);
    let after = engine.get_readiness("racy", Some(evening(19))).await;
    assert!(after.fatigue > during.fatigue);

    let cold = engine_with(store, quiet_config())
        .get_readiness("racy", Some(evening(19)))
        .await;
    assert!((after.fatigue - cold.fatigue).abs() < 1e-9);
    assert_eq!(after.score, cold.score);
}

#[tokio::test]
async fn test_first_session_scenario() {
    let store = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(Arc::clone(&store), quiet_config());
    let performed_at = day(0);

    let bench = TrainingEvent::new(
        "novice",
        "novice_first",
        "bench_press",
        performed_at,
        [MuscleGroup::Chest, MuscleGroup::Triceps],
        4,
        8,
        dec!(225),
        Some(8.0),
    )
    .unwrap();
    engine.ingest_events(vec![bench]).await.unwrap();

    let snapshot = engine
        .get_readiness("novice", Some(performed_at + Duration::hours(1)))
        .await;

    assert_eq!(snapshot.zone, RiskZone::InsufficientData);
    assert_eq!(snapshot.acwr_ratio, None);
    assert_eq!(snapshot.load_delta_pct, 0);
    assert!(snapshot.score.is_some());

    let muscles: Vec<MuscleGroup> = snapshot.muscles.iter().map(|m| m.muscle).collect();
    assert_eq!(muscles, vec![MuscleGroup::Chest, MuscleGroup::Triceps]);
    for state in &snapshot.muscles {
        let eta = state.estimated_full_recovery_at.unwrap() - performed_at;
        assert!(
            eta >= Duration::hours(36) && eta <= Duration::hours(48),
            "{} recovers after {} h",
            state.muscle,
            eta.num_hours()
        );
    }
}

#[tokio::test]
async fn test_load_trend_flags_spike_week() {
    let store = seeded_store("trend", 0..28, |d| if d >= 21 { 6 } else { 2 });
    let engine = engine_with(store, quiet_config());

    let trend = engine.get_load_trend("trend", Some(evening(27)), 7).await.unwrap();

    assert_eq!(trend.windows.len(), 7);
    assert_eq!(trend.training_days(), 7);
    assert!(trend.spike_days >= 1);
    assert!(trend.mean_ratio.unwrap() > 1.3);
}
