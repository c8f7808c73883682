// Library interface for liftload modules
// This allows integration tests and benches to access the engine

pub mod cache;
pub mod calibration;
pub mod config;
pub mod database;
pub mod error;
pub mod fitness_fatigue;
pub mod logging;
pub mod models;
pub mod muscle;
pub mod readiness;
pub mod sfr;
pub mod store;
pub mod workload;

// Re-export commonly used types for convenience
pub use models::*;
pub use cache::{CachedReadiness, SnapshotCache};
pub use calibration::{CalibrationOutcome, Calibrator};
pub use config::{AppConfig, EngineConfig};
pub use database::SqliteEventStore;
pub use error::{EngineError, Result};
pub use fitness_fatigue::{FatigueState, FitnessFatigueModel};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use muscle::{MuscleRecoveryState, MuscleRecoveryTracker, RecoveryStatus};
pub use readiness::{LoadTrend, ReadinessEngine, ReadinessSnapshot};
pub use sfr::{ExerciseEfficiency, SfrAnalyzer, SfrZone};
pub use store::{EventAdapter, EventStore, InMemoryEventStore, LoggedSetRecord};
pub use workload::{AcwrCalculator, RiskZone, WorkloadWindow};
