use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::calibration::CalibrationConfig;
use crate::fitness_fatigue::{BanisterConfig, ImpulseConfig};
use crate::logging::LogConfig;
use crate::muscle::MuscleRecoveryConfig;
use crate::readiness::ReadinessConfig;
use crate::sfr::SfrConfig;
use crate::workload::AcwrConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// SQLite event store location
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub logging: LogConfig,

    /// Model and orchestration tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Every tunable constant of the readiness engine
///
/// Sections missing from a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub acwr: AcwrConfig,
    pub impulse: ImpulseConfig,
    pub banister: BanisterConfig,
    pub muscle: MuscleRecoveryConfig,
    pub sfr: SfrConfig,
    pub calibration: CalibrationConfig,
    pub readiness: ReadinessConfig,
    pub cache: CacheConfig,

    /// Store reads slower than this fall back to cached snapshots
    pub fetch_timeout_ms: u64,

    /// Schedule a calibration run after each ingested session
    pub calibrate_on_ingest: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            acwr: AcwrConfig::default(),
            impulse: ImpulseConfig::default(),
            banister: BanisterConfig::default(),
            muscle: MuscleRecoveryConfig::default(),
            sfr: SfrConfig::default(),
            calibration: CalibrationConfig::default(),
            readiness: ReadinessConfig::default(),
            cache: CacheConfig::default(),
            fetch_timeout_ms: 2000,
            calibrate_on_ingest: true,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("liftload")
        .join("liftload.db")
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();

        AppConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            database_path: default_database_path(),
            logging: LogConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".liftload")
            .join("config.toml")
    }

    /// Load `path` (or the default location), falling back to defaults if it is missing
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from_file(&config_path)
    }

    /// Save configuration to default location
    pub fn save_default(&mut self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to_file(config_path)
    }
}
