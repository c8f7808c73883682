use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::cache::CachedReadiness;
use crate::error::{DatabaseError, EngineError, Result};
use crate::models::{ContextSample, MuscleGroup, RecoveryParameters, TrainingEvent};
use crate::store::{day_start, EventStore};

/// SQLite-backed event store
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

/// Raw `training_events` row before validation
struct EventRow {
    id: String,
    user_id: String,
    session_id: String,
    exercise_id: String,
    performed_at_ms: i64,
    muscles: String,
    sets: u32,
    reps: u32,
    load: String,
    rpe: Option<f64>,
    is_eccentric: bool,
    is_ballistic: bool,
    set_duration_secs: Option<u32>,
    rest_interval_secs: Option<u32>,
}

/// Row counts for the status display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub event_count: usize,
    pub tombstoned_event_count: usize,
    pub user_count: usize,
    pub context_sample_count: usize,
    pub snapshot_count: usize,
}

impl SqliteEventStore {
    /// Create or open a database at the specified path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(DatabaseError::from)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::from)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Database(DatabaseError::Poisoned(e.to_string())))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> std::result::Result<usize, DatabaseError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            event_count: count("SELECT COUNT(*) FROM training_events WHERE deleted_at_ms IS NULL")?,
            tombstoned_event_count: count(
                "SELECT COUNT(*) FROM training_events WHERE deleted_at_ms IS NOT NULL",
            )?,
            user_count: count("SELECT COUNT(DISTINCT user_id) FROM training_events")?,
            context_sample_count: count("SELECT COUNT(*) FROM context_samples")?,
            snapshot_count: count("SELECT COUNT(*) FROM readiness_snapshots")?,
        })
    }
}

/// Initialize database schema with tables and indexes
fn init_schema(conn: &Connection) -> std::result::Result<(), DatabaseError> {
    // journal_mode returns a row, so it cannot go through execute
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous=NORMAL", [])?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS training_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            exercise_id TEXT NOT NULL,
            performed_at_ms INTEGER NOT NULL,
            muscles TEXT NOT NULL,
            sets INTEGER NOT NULL,
            reps INTEGER NOT NULL,
            load TEXT NOT NULL,
            rpe REAL,
            is_eccentric BOOLEAN NOT NULL DEFAULT FALSE,
            is_ballistic BOOLEAN NOT NULL DEFAULT FALSE,
            set_duration_secs INTEGER,
            rest_interval_secs INTEGER,

            -- Soft delete; tombstoned rows stay for audit
            deleted_at_ms INTEGER
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS context_samples (
            user_id TEXT NOT NULL,
            date TEXT NOT NULL,
            sleep_hours REAL,
            sleep_quality INTEGER,
            stress INTEGER,
            nutrition_quality INTEGER,
            soreness INTEGER,
            PRIMARY KEY (user_id, date)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS recovery_parameters (
            user_id TEXT PRIMARY KEY,
            upper_recovery_hours REAL NOT NULL,
            lower_recovery_hours REAL NOT NULL,
            fatigue_resistance REAL NOT NULL,
            last_calibrated_at_ms INTEGER,
            confidence REAL NOT NULL,
            session_count INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS readiness_snapshots (
            user_id TEXT NOT NULL,
            as_of_ms INTEGER NOT NULL,
            payload BLOB NOT NULL,
            PRIMARY KEY (user_id, as_of_ms)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_user_time ON training_events (user_id, performed_at_ms)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_session ON training_events (session_id)",
        [],
    )?;

    Ok(())
}

const EVENT_COLUMNS: &str = "id, user_id, session_id, exercise_id, performed_at_ms, muscles, sets, reps, \
     load, rpe, is_eccentric, is_ballistic, set_duration_secs, rest_interval_secs";

fn event_row(row: &Row) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        exercise_id: row.get("exercise_id")?,
        performed_at_ms: row.get("performed_at_ms")?,
        muscles: row.get("muscles")?,
        sets: row.get("sets")?,
        reps: row.get("reps")?,
        load: row.get("load")?,
        rpe: row.get("rpe")?,
        is_eccentric: row.get("is_eccentric")?,
        is_ballistic: row.get("is_ballistic")?,
        set_duration_secs: row.get("set_duration_secs")?,
        rest_interval_secs: row.get("rest_interval_secs")?,
    })
}

impl EventRow {
    fn into_event(self) -> Result<TrainingEvent> {
        let corrupt = |reason: String| {
            EngineError::Database(DatabaseError::CorruptRow {
                table: "training_events".to_string(),
                reason,
            })
        };

        let timestamp = from_millis(self.performed_at_ms)
            .ok_or_else(|| corrupt(format!("timestamp {} out of range", self.performed_at_ms)))?;
        let load: Decimal = self
            .load
            .parse()
            .map_err(|_| corrupt(format!("load {} is not a decimal", self.load)))?;
        let muscles = self
            .muscles
            .split(',')
            .filter(|m| !m.is_empty())
            .map(|m| m.parse::<MuscleGroup>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| corrupt(e.to_string()))?;

        let event = TrainingEvent::new(
            self.user_id,
            self.session_id,
            self.exercise_id,
            timestamp,
            muscles,
            self.sets,
            self.reps,
            load,
            self.rpe,
        )
        .map_err(|e| corrupt(e.to_string()))?;

        Ok(event
            .with_id(self.id)
            .with_eccentric(self.is_eccentric)
            .with_ballistic(self.is_ballistic)
            .with_timing(self.set_duration_secs, self.rest_interval_secs))
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn collect_events(rows: Vec<EventRow>) -> Result<Vec<TrainingEvent>> {
    rows.into_iter().map(EventRow::into_event).collect()
}

fn invalidate_snapshots(
    conn: &Connection,
    user_id: &str,
    from: DateTime<Utc>,
) -> std::result::Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM readiness_snapshots WHERE user_id = ?1 AND as_of_ms >= ?2",
        params![user_id, from.timestamp_millis()],
    )?)
}

impl EventStore for SqliteEventStore {
    fn fetch_training_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrainingEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM training_events \
             WHERE user_id = ?1 AND performed_at_ms >= ?2 AND performed_at_ms <= ?3 \
             AND deleted_at_ms IS NULL \
             ORDER BY performed_at_ms ASC, id ASC",
            EVENT_COLUMNS
        );

        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(
                params![user_id, from.timestamp_millis(), to.timestamp_millis()],
                event_row,
            )
            .map_err(DatabaseError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DatabaseError::from)?;

        collect_events(rows)
    }

    fn fetch_session_events(&self, session_id: &str) -> Result<Vec<TrainingEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM training_events \
             WHERE session_id = ?1 AND deleted_at_ms IS NULL \
             ORDER BY performed_at_ms ASC, id ASC",
            EVENT_COLUMNS
        );

        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(params![session_id], event_row)
            .map_err(DatabaseError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DatabaseError::from)?;

        collect_events(rows)
    }

    fn fetch_context_samples(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ContextSample>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT user_id, date, sleep_hours, sleep_quality, stress, nutrition_quality, soreness
                FROM context_samples
                WHERE user_id = ?1 AND date >= ?2 AND date <= ?3
                ORDER BY date ASC
                "#,
            )
            .map_err(DatabaseError::from)?;

        let rows = stmt
            .query_map(params![user_id, from.to_string(), to.to_string()], |row| {
                Ok((
                    row.get::<_, String>("user_id")?,
                    row.get::<_, String>("date")?,
                    row.get::<_, Option<f64>>("sleep_hours")?,
                    row.get::<_, Option<u8>>("sleep_quality")?,
                    row.get::<_, Option<u8>>("stress")?,
                    row.get::<_, Option<u8>>("nutrition_quality")?,
                    row.get::<_, Option<u8>>("soreness")?,
                ))
            })
            .map_err(DatabaseError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DatabaseError::from)?;

        rows.into_iter()
            .map(|(user_id, date, sleep_hours, sleep_quality, stress, nutrition_quality, soreness)| {
                let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                    EngineError::Database(DatabaseError::CorruptRow {
                        table: "context_samples".to_string(),
                        reason: e.to_string(),
                    })
                })?;
                Ok(ContextSample {
                    user_id,
                    date,
                    sleep_hours,
                    sleep_quality,
                    stress,
                    nutrition_quality,
                    soreness,
                })
            })
            .collect()
    }

    fn fetch_recovery_parameters(&self, user_id: &str) -> Result<RecoveryParameters> {
        let conn = self.conn()?;
        let stored = conn
            .query_row(
                r#"
                SELECT upper_recovery_hours, lower_recovery_hours, fatigue_resistance,
                       last_calibrated_at_ms, confidence, session_count
                FROM recovery_parameters
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok(RecoveryParameters {
                        upper_recovery_hours: row.get(0)?,
                        lower_recovery_hours: row.get(1)?,
                        fatigue_resistance: row.get(2)?,
                        last_calibrated_at: row
                            .get::<_, Option<i64>>(3)?
                            .and_then(from_millis),
                        confidence: row.get(4)?,
                        session_count: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::from)?;

        Ok(stored.unwrap_or_default())
    }

    fn persist_recovery_parameters(&self, user_id: &str, params: &RecoveryParameters) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO recovery_parameters (
                user_id, upper_recovery_hours, lower_recovery_hours, fatigue_resistance,
                last_calibrated_at_ms, confidence, session_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                user_id,
                params.upper_recovery_hours,
                params.lower_recovery_hours,
                params.fatigue_resistance,
                params.last_calibrated_at.map(|ts| ts.timestamp_millis()),
                params.confidence,
                params.session_count,
            ],
        )
        .map_err(DatabaseError::from)?;

        Ok(())
    }

    fn persist_readiness_snapshot(&self, user_id: &str, cached: &CachedReadiness) -> Result<()> {
        let payload = bincode::serialize(cached)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO readiness_snapshots (user_id, as_of_ms, payload) VALUES (?1, ?2, ?3)",
            params![user_id, cached.snapshot.as_of.timestamp_millis(), payload],
        )
        .map_err(DatabaseError::from)?;

        Ok(())
    }

    fn fetch_cached_snapshot(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<CachedReadiness>> {
        let conn = self.conn()?;
        let payload: Option<Vec<u8>> = conn
            .query_row(
                r#"
                SELECT payload FROM readiness_snapshots
                WHERE user_id = ?1 AND as_of_ms <= ?2
                ORDER BY as_of_ms DESC
                LIMIT 1
                "#,
                params![user_id, as_of.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::from)?;

        payload
            .map(|bytes| {
                bincode::deserialize::<CachedReadiness>(&bytes)
                    .map_err(|e| EngineError::Database(DatabaseError::Serialization(e.to_string())))
            })
            .transpose()
    }

    fn append_training_events(&self, events: &[TrainingEvent]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::from)?;

        for event in events {
            let muscles = event
                .primary_muscles
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(",");

            tx.execute(
                r#"
                INSERT OR REPLACE INTO training_events (
                    id, user_id, session_id, exercise_id, performed_at_ms, muscles, sets, reps,
                    load, rpe, is_eccentric, is_ballistic, set_duration_secs, rest_interval_secs
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    event.id,
                    event.user_id,
                    event.session_id,
                    event.exercise_id,
                    event.timestamp.timestamp_millis(),
                    muscles,
                    event.sets,
                    event.reps,
                    event.load.to_string(),
                    event.rpe.map(|r| r.value()),
                    event.is_eccentric,
                    event.is_ballistic,
                    event.set_duration_secs,
                    event.rest_interval_secs,
                ],
            )
            .map_err(DatabaseError::from)?;

            invalidate_snapshots(&tx, &event.user_id, event.timestamp)?;
        }

        tx.commit().map_err(DatabaseError::from)?;
        debug!(count = events.len(), "Stored training events");
        Ok(())
    }

    fn append_context_sample(&self, sample: &ContextSample) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::from)?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO context_samples (
                user_id, date, sleep_hours, sleep_quality, stress, nutrition_quality, soreness
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                sample.user_id,
                sample.date.to_string(),
                sample.sleep_hours,
                sample.sleep_quality,
                sample.stress,
                sample.nutrition_quality,
                sample.soreness,
            ],
        )
        .map_err(DatabaseError::from)?;
        invalidate_snapshots(&tx, &sample.user_id, day_start(sample.date))?;

        tx.commit().map_err(DatabaseError::from)?;
        Ok(())
    }

    fn drop_readiness_snapshots(&self, user_id: &str, from: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        Ok(invalidate_snapshots(&conn, user_id, from)?)
    }

    fn tombstone_session(&self, session_id: &str) -> Result<Vec<TrainingEvent>> {
        let hidden = self.fetch_session_events(session_id)?;
        if hidden.is_empty() {
            return Ok(hidden);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        tx.execute(
            "UPDATE training_events SET deleted_at_ms = ?1 WHERE session_id = ?2 AND deleted_at_ms IS NULL",
            params![Utc::now().timestamp_millis(), session_id],
        )
        .map_err(DatabaseError::from)?;

        if let Some(first) = hidden.first() {
            invalidate_snapshots(&tx, &first.user_id, first.timestamp)?;
        }

        tx.commit().map_err(DatabaseError::from)?;
        Ok(hidden)
    }

    fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM training_events WHERE deleted_at_ms IS NULL ORDER BY user_id",
            )
            .map_err(DatabaseError::from)?;

        let users = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(DatabaseError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DatabaseError::from)?;

        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn event(session: &str, hours: i64) -> TrainingEvent {
        TrainingEvent::new(
            "user_1",
            session,
            "deadlift",
            Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap() + Duration::hours(hours),
            [MuscleGroup::Hamstrings, MuscleGroup::Back],
            3,
            5,
            dec!(315.5),
            Some(8.5),
        )
        .unwrap()
        .with_eccentric(true)
    }

    #[test]
    fn test_schema_and_event_round_trip() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let original = event("s1", 0).with_timing(Some(30), None);
        store.append_training_events(&[original.clone()]).unwrap();

        let fetched = store.fetch_session_events("s1").unwrap();
        assert_eq!(fetched, vec![original]);
    }

    #[test]
    fn test_parameters_round_trip() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        assert_eq!(
            store.fetch_recovery_parameters("user_1").unwrap(),
            RecoveryParameters::population_default()
        );

        let mut params = RecoveryParameters::population_default();
        params.upper_recovery_hours = 40.0;
        params.confidence = 0.4;
        params.session_count = 7;
        params.last_calibrated_at = Some(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap());
        store.persist_recovery_parameters("user_1", &params).unwrap();

        assert_eq!(store.fetch_recovery_parameters("user_1").unwrap(), params);
    }

    #[test]
    fn test_stats_count_tombstones() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .append_training_events(&[event("s1", 0), event("s2", 24)])
            .unwrap();
        store.tombstone_session("s1").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.event_count, 1);
        assert_eq!(stats.tombstoned_event_count, 1);
        assert_eq!(stats.user_count, 1);
    }
}
