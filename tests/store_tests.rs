use chrono::{DateTime, Duration, TimeZone, Utc};
use liftload::cache::CachedReadiness;
use liftload::config::EngineConfig;
use liftload::fitness_fatigue::FatigueState;
use liftload::models::{ContextSample, MuscleGroup, RecoveryParameters, TrainingEvent};
use liftload::readiness::{ReadinessEngine, ReadinessSnapshot};
use liftload::store::{EventStore, InMemoryEventStore};
use liftload::SqliteEventStore;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::tempdir;

/// Both store implementations must honor the same contract

fn at(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::hours(hours)
}

fn squat(user: &str, session: &str, hours: i64) -> TrainingEvent {
    TrainingEvent::new(
        user,
        session,
        "back_squat",
        at(hours),
        [MuscleGroup::Quadriceps, MuscleGroup::Glutes],
        5,
        5,
        dec!(140),
        Some(8.0),
    )
    .unwrap()
}

fn cached(user: &str, hours: i64) -> CachedReadiness {
    CachedReadiness {
        snapshot: ReadinessSnapshot::no_history(user, at(hours)),
        fatigue_state: Some(FatigueState {
            at: at(hours),
            fitness: 1.5,
            fatigue: 2.25,
        }),
        history_start: Some(at(0)),
    }
}

fn check_contract(store: &dyn EventStore) {
    store
        .append_training_events(&[
            squat("u1", "s1", 0),
            squat("u1", "s2", 48),
            squat("u1", "s3", 96),
            squat("u2", "s4", 48),
        ])
        .unwrap();

    // Inclusive on both ends, ascending, scoped to the user
    let events = store.fetch_training_events("u1", at(0), at(48)).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].timestamp < events[1].timestamp);
    assert!(events.iter().all(|e| e.user_id == "u1"));

    // Tombstoned sessions disappear from every read
    let hidden = store.tombstone_session("s2").unwrap();
    assert_eq!(hidden.len(), 1);
    assert_eq!(store.fetch_training_events("u1", at(0), at(200)).unwrap().len(), 2);
    assert!(store.fetch_session_events("s2").unwrap().is_empty());

    // Context samples by inclusive date range
    let day = at(0).date_naive();
    let mut sample = ContextSample::empty("u1", day);
    sample.sleep_hours = Some(6.5);
    store.append_context_sample(&sample).unwrap();
    assert_eq!(store.fetch_context_samples("u1", day, day).unwrap(), vec![sample]);
    assert!(store
        .fetch_context_samples("u1", day.succ_opt().unwrap(), day)
        .unwrap()
        .is_empty());

    // Snapshots: newest at or before the requested time
    store.persist_readiness_snapshot("u1", &cached("u1", 10)).unwrap();
    store.persist_readiness_snapshot("u1", &cached("u1", 20)).unwrap();
    let found = store.fetch_cached_snapshot("u1", at(15)).unwrap().unwrap();
    assert_eq!(found.snapshot.as_of, at(10));
    assert_eq!(found.fatigue_state, cached("u1", 10).fatigue_state);
    assert_eq!(found.history_start, Some(at(0)));
    assert!(store.fetch_cached_snapshot("u1", at(5)).unwrap().is_none());

    // A late write drops persisted snapshots from its timestamp on
    store.append_training_events(&[squat("u1", "s5", 12)]).unwrap();
    let found = store.fetch_cached_snapshot("u1", at(30)).unwrap().unwrap();
    assert_eq!(found.snapshot.as_of, at(10));

    // Explicit drop is forward-only too
    store.persist_readiness_snapshot("u1", &cached("u1", 40)).unwrap();
    assert_eq!(store.drop_readiness_snapshots("u1", at(11)).unwrap(), 1);
    assert_eq!(
        store.fetch_cached_snapshot("u1", at(50)).unwrap().unwrap().snapshot.as_of,
        at(10)
    );

    let mut users = store.list_users().unwrap();
    users.sort();
    assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
}

#[test]
fn test_in_memory_store_contract() {
    check_contract(&InMemoryEventStore::new());
}

#[test]
fn test_sqlite_store_contract() {
    check_contract(&SqliteEventStore::open_in_memory().unwrap());
}

#[test]
fn test_sqlite_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data").join("liftload.db");

    {
        let store = SqliteEventStore::open(&path).unwrap();
        store.append_training_events(&[squat("u1", "s1", 0)]).unwrap();

        let mut params = RecoveryParameters::population_default();
        params.lower_recovery_hours = 60.0;
        store.persist_recovery_parameters("u1", &params).unwrap();
    }

    let reopened = SqliteEventStore::open(&path).unwrap();
    let events = reopened.fetch_training_events("u1", at(-1), at(1)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].load, dec!(140));
    assert_eq!(
        reopened.fetch_recovery_parameters("u1").unwrap().lower_recovery_hours,
        60.0
    );
}

#[tokio::test]
async fn test_engine_over_sqlite_persists_snapshots() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteEventStore::open(dir.path().join("engine.db")).unwrap());
    let events: Vec<TrainingEvent> = (0..20)
        .map(|d| squat("lifter", &format!("s{}", d), d * 24))
        .collect();
    store.append_training_events(&events).unwrap();

    let config = EngineConfig {
        calibrate_on_ingest: false,
        ..EngineConfig::default()
    };
    let engine = ReadinessEngine::new(Arc::clone(&store), config);
    let as_of = at(19 * 24 + 6);
    let snapshot = engine.get_readiness("lifter", Some(as_of)).await;
    assert!(snapshot.score.is_some());

    // Persistence runs in the background
    let mut persisted = None;
    for _ in 0..50 {
        persisted = store.fetch_cached_snapshot("lifter", as_of).unwrap();
        if persisted.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let persisted = persisted.expect("snapshot was not persisted");
    assert_eq!(persisted.snapshot, snapshot);
    assert!(persisted.fatigue_state.is_some());
}
