//! Unified error hierarchy for liftload
//!
//! Only the ingestion boundary and the storage adapters return these errors.
//! The readiness path turns every data-shape problem into a well-defined
//! sentinel result instead (see `RiskZone::InsufficientData`).

use thiserror::Error;

/// Top-level error type for all liftload operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed event or context record rejected at ingestion
    #[error("Invalid input in {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// Persistence fetch failed or timed out
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Calibration could not run; last-known parameters stay in effect
    #[error("Calibration stale: {0}")]
    CalibrationStale(String),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage adapter errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored row could not be mapped back onto a domain type
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    /// Lock poisoned by a panicking writer
    #[error("Store lock poisoned: {0}")]
    Poisoned(String),
}

/// Result type alias for liftload operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Shorthand for an ingestion rejection
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamUnavailable(_)
                | EngineError::Database(DatabaseError::Sqlite(_))
                | EngineError::Io(_)
        )
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InvalidInput { field, reason } => {
                format!("The logged set could not be saved ({}: {})", field, reason)
            }
            EngineError::UpstreamUnavailable(_) => {
                "Training history is temporarily unavailable. Showing the last known readiness."
                    .to_string()
            }
            EngineError::CalibrationStale(_) => {
                "Personal recovery calibration is out of date; the last calibrated values are still in use."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}
