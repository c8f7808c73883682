//! Event store boundary
//!
//! The [`EventStore`] trait is the only way the engine reaches persisted
//! data. Legacy logged-set rows, whose metadata is a loosely typed JSON blob,
//! are mapped onto [`TrainingEvent`] exactly once here by [`EventAdapter`];
//! everything downstream sees validated, strongly typed events.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use crate::cache::CachedReadiness;
use crate::error::{DatabaseError, EngineError, Result};
use crate::models::{ContextSample, MuscleGroup, RecoveryParameters, TrainingEvent};

/// Persistence contract consumed by the engine
///
/// Implementations must be safe to call from several threads at once.
/// Reads exclude tombstoned sessions.
pub trait EventStore: Send + Sync {
    /// Events with `from <= timestamp <= to`, ascending by timestamp
    fn fetch_training_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrainingEvent>>;

    /// Events of one session, ascending by timestamp
    fn fetch_session_events(&self, session_id: &str) -> Result<Vec<TrainingEvent>>;

    /// Context samples with `from <= date <= to`; may be empty
    fn fetch_context_samples(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ContextSample>>;

    /// Calibrated parameters, or population defaults when none are stored
    fn fetch_recovery_parameters(&self, user_id: &str) -> Result<RecoveryParameters>;

    fn persist_recovery_parameters(&self, user_id: &str, params: &RecoveryParameters) -> Result<()>;

    fn persist_readiness_snapshot(&self, user_id: &str, cached: &CachedReadiness) -> Result<()>;

    /// Most recent persisted snapshot with `as_of <= as_of`
    fn fetch_cached_snapshot(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<CachedReadiness>>;

    /// Remove the user's persisted snapshots with `as_of >= from`, returning how many went
    fn drop_readiness_snapshots(&self, user_id: &str, from: DateTime<Utc>) -> Result<usize>;

    /// Append validated events; persisted snapshots at or after the earliest one are dropped
    fn append_training_events(&self, events: &[TrainingEvent]) -> Result<()>;

    /// Insert or replace the sample for its date
    fn append_context_sample(&self, sample: &ContextSample) -> Result<()>;

    /// Soft-delete a session, returning the events that were hidden
    fn tombstone_session(&self, session_id: &str) -> Result<Vec<TrainingEvent>>;

    fn list_users(&self) -> Result<Vec<String>>;
}

/// Legacy storage shape of one logged exercise
///
/// `metadata` is a JSON object carrying `schema_version` plus the set data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedSetRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub exercise_id: String,
    pub performed_at: String,
    pub metadata: String,
}

/// Schema version 1: basic set data
#[derive(Debug, Deserialize)]
struct SetMetadataV1 {
    sets: i64,
    reps: i64,
    weight: Decimal,
    #[serde(default)]
    rpe: Option<f64>,
    muscles: Vec<String>,
}

/// Schema version 2: adds movement flags and timing
#[derive(Debug, Deserialize)]
struct SetMetadataV2 {
    sets: i64,
    reps: i64,
    weight: Decimal,
    #[serde(default)]
    rpe: Option<f64>,
    muscles: Vec<String>,
    #[serde(default)]
    eccentric: bool,
    #[serde(default)]
    ballistic: bool,
    #[serde(default)]
    set_duration_secs: Option<u32>,
    #[serde(default)]
    rest_secs: Option<u32>,
}

/// Versioned translation between legacy rows and [`TrainingEvent`]
pub struct EventAdapter;

impl EventAdapter {
    pub const CURRENT_SCHEMA_VERSION: u64 = 2;

    /// Validate and convert one legacy record
    pub fn to_training_event(record: &LoggedSetRecord) -> Result<TrainingEvent> {
        let timestamp = parse_timestamp(&record.performed_at)?;

        if record.user_id.trim().is_empty() {
            return Err(EngineError::invalid("user_id", "must not be empty"));
        }
        if record.session_id.trim().is_empty() {
            return Err(EngineError::invalid("session_id", "must not be empty"));
        }

        let metadata: serde_json::Value = serde_json::from_str(&record.metadata)
            .map_err(|e| EngineError::invalid("metadata", e.to_string()))?;
        let version = metadata
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EngineError::invalid("metadata", "missing schema_version"))?;

        let (sets, reps, weight, rpe, muscles, eccentric, ballistic, duration, rest) = match version {
            1 => {
                let m: SetMetadataV1 = serde_json::from_value(metadata)
                    .map_err(|e| EngineError::invalid("metadata", e.to_string()))?;
                (m.sets, m.reps, m.weight, m.rpe, m.muscles, false, false, None, None)
            }
            2 => {
                let m: SetMetadataV2 = serde_json::from_value(metadata)
                    .map_err(|e| EngineError::invalid("metadata", e.to_string()))?;
                (
                    m.sets,
                    m.reps,
                    m.weight,
                    m.rpe,
                    m.muscles,
                    m.eccentric,
                    m.ballistic,
                    m.set_duration_secs,
                    m.rest_secs,
                )
            }
            other => {
                return Err(EngineError::invalid(
                    "schema_version",
                    format!("unsupported version {}", other),
                ))
            }
        };

        let sets = non_negative_count("sets", sets)?;
        let reps = non_negative_count("reps", reps)?;
        let muscles = muscles
            .iter()
            .map(|m| m.parse::<MuscleGroup>())
            .collect::<Result<Vec<_>>>()?;

        let mut event = TrainingEvent::new(
            record.user_id.clone(),
            record.session_id.clone(),
            record.exercise_id.clone(),
            timestamp,
            muscles,
            sets,
            reps,
            weight,
            rpe,
        )?
        .with_eccentric(eccentric)
        .with_ballistic(ballistic)
        .with_timing(duration, rest);

        if let Some(id) = &record.id {
            event = event.with_id(id.clone());
        }

        Ok(event)
    }

    /// Convert a batch, failing on the first invalid record
    pub fn to_training_events(records: &[LoggedSetRecord]) -> Result<Vec<TrainingEvent>> {
        records.iter().map(Self::to_training_event).collect()
    }

    /// Write an event back in the current legacy shape
    pub fn to_record(event: &TrainingEvent) -> LoggedSetRecord {
        let metadata = serde_json::json!({
            "schema_version": Self::CURRENT_SCHEMA_VERSION,
            "sets": event.sets,
            "reps": event.reps,
            "weight": event.load.to_string(),
            "rpe": event.rpe.map(|r| r.value()),
            "muscles": event.primary_muscles.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "eccentric": event.is_eccentric,
            "ballistic": event.is_ballistic,
            "set_duration_secs": event.set_duration_secs,
            "rest_secs": event.rest_interval_secs,
        });

        LoggedSetRecord {
            id: Some(event.id.clone()),
            user_id: event.user_id.clone(),
            session_id: event.session_id.clone(),
            exercise_id: event.exercise_id.clone(),
            performed_at: event.timestamp.to_rfc3339(),
            metadata: metadata.to_string(),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    // Older rows were written without an offset and are UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| EngineError::invalid("performed_at", format!("malformed timestamp: {}", raw)))
}

fn non_negative_count(field: &str, value: i64) -> Result<u32> {
    if value < 0 {
        return Err(EngineError::invalid(field, format!("{} must be non-negative", value)));
    }
    u32::try_from(value).map_err(|_| EngineError::invalid(field, format!("{} is too large", value)))
}

/// Thread-safe in-process store
///
/// Backs the tests and benches and the CLI when no database is configured.
/// Availability can be toggled to exercise the engine's fallback path.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<BTreeMap<String, Vec<TrainingEvent>>>,
    tombstoned: RwLock<HashSet<String>>,
    context: RwLock<BTreeMap<(String, NaiveDate), ContextSample>>,
    parameters: RwLock<HashMap<String, RecoveryParameters>>,
    snapshots: RwLock<BTreeMap<(String, DateTime<Utc>), CachedReadiness>>,
    unavailable: AtomicBool,
    fetch_latency_ms: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every fetch fail with `UpstreamUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every training-event fetch; the data is read before the delay
    pub fn set_fetch_latency(&self, latency: std::time::Duration) {
        self.fetch_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.events
            .read()
            .map(|events| events.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::UpstreamUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn simulate_latency(&self) {
        let ms = self.fetch_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(ms));
        }
    }

    fn drop_snapshots_from(&self, user_id: &str, from: DateTime<Utc>) -> Result<usize> {
        let mut snapshots = write(&self.snapshots)?;
        let before = snapshots.len();
        snapshots.retain(|(user, as_of), _| !(user == user_id && *as_of >= from));
        Ok(before - snapshots.len())
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| EngineError::Database(DatabaseError::Poisoned(e.to_string())))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| EngineError::Database(DatabaseError::Poisoned(e.to_string())))
}

impl EventStore for InMemoryEventStore {
    fn fetch_training_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrainingEvent>> {
        self.check_available()?;

        let mut result: Vec<TrainingEvent> = {
            let events = read(&self.events)?;
            let tombstoned = read(&self.tombstoned)?;
            events
                .get(user_id)
                .map(|list| {
                    list.iter()
                        .filter(|e| e.timestamp >= from && e.timestamp <= to)
                        .filter(|e| !tombstoned.contains(&e.session_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        result.sort_by_key(|e| e.timestamp);

        self.simulate_latency();
        Ok(result)
    }

    fn fetch_session_events(&self, session_id: &str) -> Result<Vec<TrainingEvent>> {
        self.check_available()?;

        if read(&self.tombstoned)?.contains(session_id) {
            return Ok(Vec::new());
        }

        let events = read(&self.events)?;
        let mut result: Vec<TrainingEvent> = events
            .values()
            .flatten()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.timestamp);

        Ok(result)
    }

    fn fetch_context_samples(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ContextSample>> {
        self.check_available()?;
        if from > to {
            return Ok(Vec::new());
        }

        let context = read(&self.context)?;
        Ok(context
            .range((user_id.to_string(), from)..=(user_id.to_string(), to))
            .map(|(_, sample)| sample.clone())
            .collect())
    }

    fn fetch_recovery_parameters(&self, user_id: &str) -> Result<RecoveryParameters> {
        self.check_available()?;

        Ok(read(&self.parameters)?
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn persist_recovery_parameters(&self, user_id: &str, params: &RecoveryParameters) -> Result<()> {
        write(&self.parameters)?.insert(user_id.to_string(), params.clone());
        Ok(())
    }

    fn persist_readiness_snapshot(&self, user_id: &str, cached: &CachedReadiness) -> Result<()> {
        write(&self.snapshots)?.insert((user_id.to_string(), cached.snapshot.as_of), cached.clone());
        Ok(())
    }

    fn fetch_cached_snapshot(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<CachedReadiness>> {
        let snapshots = read(&self.snapshots)?;
        Ok(snapshots
            .range((user_id.to_string(), DateTime::<Utc>::MIN_UTC)..=(user_id.to_string(), as_of))
            .next_back()
            .map(|(_, cached)| cached.clone()))
    }

    fn drop_readiness_snapshots(&self, user_id: &str, from: DateTime<Utc>) -> Result<usize> {
        self.drop_snapshots_from(user_id, from)
    }

    fn append_training_events(&self, new_events: &[TrainingEvent]) -> Result<()> {
        let mut earliest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        {
            let mut events = write(&self.events)?;
            for event in new_events {
                events
                    .entry(event.user_id.clone())
                    .or_default()
                    .push(event.clone());
                earliest
                    .entry(event.user_id.clone())
                    .and_modify(|ts| *ts = (*ts).min(event.timestamp))
                    .or_insert(event.timestamp);
            }
        }

        for (user_id, from) in earliest {
            self.drop_snapshots_from(&user_id, from)?;
        }

        debug!(count = new_events.len(), "Appended training events");
        Ok(())
    }

    fn append_context_sample(&self, sample: &ContextSample) -> Result<()> {
        write(&self.context)?.insert((sample.user_id.clone(), sample.date), sample.clone());
        self.drop_snapshots_from(&sample.user_id, day_start(sample.date))
            .map(|_| ())
    }

    fn tombstone_session(&self, session_id: &str) -> Result<Vec<TrainingEvent>> {
        let hidden = self.fetch_session_events(session_id)?;
        write(&self.tombstoned)?.insert(session_id.to_string());

        if let Some(first) = hidden.first() {
            self.drop_snapshots_from(&first.user_id, first.timestamp)?;
        }

        Ok(hidden)
    }

    fn list_users(&self) -> Result<Vec<String>> {
        Ok(read(&self.events)?.keys().cloned().collect())
    }
}

/// Midnight UTC at the start of `date`
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn record(metadata: &str) -> LoggedSetRecord {
        LoggedSetRecord {
            id: Some("evt_1".to_string()),
            user_id: "user_1".to_string(),
            session_id: "session_1".to_string(),
            exercise_id: "bench_press".to_string(),
            performed_at: "2024-01-01T10:00:00Z".to_string(),
            metadata: metadata.to_string(),
        }
    }

    fn event(session: &str, hours: i64) -> TrainingEvent {
        TrainingEvent::new(
            "user_1",
            session,
            "squat",
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::hours(hours),
            [MuscleGroup::Quadriceps],
            3,
            5,
            dec!(225),
            Some(8.0),
        )
        .unwrap()
    }

    #[test]
    fn test_v1_record_mapping() {
        let event = EventAdapter::to_training_event(&record(
            r#"{"schema_version":1,"sets":4,"reps":8,"weight":225,"rpe":8,"muscles":["chest","triceps"]}"#,
        ))
        .unwrap();

        assert_eq!(event.id, "evt_1");
        assert_eq!(event.volume(), dec!(7200));
        assert_eq!(event.rpe.map(|r| r.value()), Some(8.0));
        assert!(event.touches(MuscleGroup::Triceps));
        assert!(!event.is_eccentric);
    }

    #[test]
    fn test_v2_record_mapping() {
        let event = EventAdapter::to_training_event(&record(
            r#"{"schema_version":2,"sets":3,"reps":10,"weight":"60.5","muscles":["hams"],"eccentric":true,"rest_secs":90}"#,
        ))
        .unwrap();

        assert!(event.is_eccentric);
        assert!(event.rpe.is_none());
        assert_eq!(event.rest_interval_secs, Some(90));
        assert_eq!(event.load, dec!(60.5));
    }

    #[test]
    fn test_rejects_invalid_records() {
        let cases = [
            r#"{"schema_version":1,"sets":-1,"reps":8,"weight":225,"muscles":["chest"]}"#,
            r#"{"schema_version":1,"sets":4,"reps":8,"weight":-5,"muscles":["chest"]}"#,
            r#"{"schema_version":1,"sets":4294967295,"reps":4294967295,"weight":1e10,"muscles":["chest"]}"#,
            r#"{"schema_version":2,"sets":4,"reps":8,"weight":"20000","muscles":["chest"]}"#,
            r#"{"schema_version":1,"sets":4,"reps":8,"weight":225,"rpe":8.3,"muscles":["chest"]}"#,
            r#"{"schema_version":1,"sets":4,"reps":8,"weight":225,"muscles":["wings"]}"#,
            r#"{"schema_version":9,"sets":4,"reps":8,"weight":225,"muscles":["chest"]}"#,
            r#"{"sets":4,"reps":8,"weight":225,"muscles":["chest"]}"#,
            "not json",
        ];

        for metadata in cases {
            let result = EventAdapter::to_training_event(&record(metadata));
            assert!(
                matches!(result, Err(EngineError::InvalidInput { .. })),
                "accepted {}",
                metadata
            );
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let mut legacy = record(r#"{"schema_version":1,"sets":1,"reps":1,"weight":100,"muscles":["back"]}"#);
        legacy.performed_at = "2024-01-01 10:00:00".to_string();
        let event = EventAdapter::to_training_event(&legacy).unwrap();
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());

        legacy.performed_at = "yesterday".to_string();
        assert!(EventAdapter::to_training_event(&legacy).is_err());
    }

    #[test]
    fn test_record_round_trip_preserves_event() {
        let original = event("s1", 0).with_ballistic(true).with_timing(Some(40), Some(120));
        let restored = EventAdapter::to_training_event(&EventAdapter::to_record(&original)).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_in_memory_fetch_is_ordered_and_inclusive() {
        let store = InMemoryEventStore::new();
        store
            .append_training_events(&[event("s2", 48), event("s1", 0), event("s3", 96)])
            .unwrap();

        let from = event("x", 0).timestamp;
        let to = event("x", 48).timestamp;
        let events = store.fetch_training_events("user_1", from, to).unwrap();

        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp < events[1].timestamp);
    }

    #[test]
    fn test_tombstoned_sessions_are_hidden() {
        let store = InMemoryEventStore::new();
        store.append_training_events(&[event("s1", 0), event("s2", 24)]).unwrap();

        let hidden = store.tombstone_session("s1").unwrap();
        assert_eq!(hidden.len(), 1);

        let events = store
            .fetch_training_events("user_1", DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "s2");
        assert!(store.fetch_session_events("s1").unwrap().is_empty());
    }

    #[test]
    fn test_parameters_default_when_absent() {
        let store = InMemoryEventStore::new();
        let params = store.fetch_recovery_parameters("nobody").unwrap();
        assert_eq!(params, RecoveryParameters::population_default());
    }

    #[test]
    fn test_unavailable_store_fails_fetches() {
        let store = InMemoryEventStore::new();
        store.set_unavailable(true);
        let result = store.fetch_training_events("user_1", DateTime::<Utc>::MIN_UTC, Utc::now());
        assert!(matches!(result, Err(EngineError::UpstreamUnavailable(_))));
    }
}
