//! Configuration management for mdraid

use crate::error::{Error, Result};
use crate::superblock::MetadataFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default guaranteed resync speed: 1000 KiB/s per disk
pub const DEFAULT_SPEED_LIMIT_MIN: u64 = 1000;

/// Default resync speed ceiling: 200000 KiB/s per disk
pub const DEFAULT_SPEED_LIMIT_MAX: u64 = 200_000;

/// Default chunk size for striped levels: 512 KiB
pub const DEFAULT_CHUNK_KIB: u32 = 512;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Resync engine configuration
    pub resync: ResyncConfig,

    /// Recovery supervisor configuration
    pub supervisor: SupervisorConfig,

    /// Metadata defaults for new arrays
    pub metadata: MetadataConfig,
}

/// Resync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Minimum guaranteed resync speed in KiB/s
    pub speed_limit_min: u64,

    /// Maximum resync speed in KiB/s
    pub speed_limit_max: u64,

    /// Pause when throttling (ms)
    pub throttle_sleep_ms: u64,
}

/// Recovery supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between sweeps (ms)
    pub interval_ms: u64,

    /// Idle time after the last write before an array is marked clean (ms)
    pub safemode_delay_ms: u64,
}

/// Metadata defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Superblock format for new arrays
    pub format: MetadataFormat,

    /// Chunk size for striped levels in KiB
    pub chunk_kib: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            resync: ResyncConfig::default(),
            supervisor: SupervisorConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        ResyncConfig {
            speed_limit_min: DEFAULT_SPEED_LIMIT_MIN,
            speed_limit_max: DEFAULT_SPEED_LIMIT_MAX,
            throttle_sleep_ms: 500,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            interval_ms: 1000,
            safemode_delay_ms: 200,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            format: MetadataFormat::default(),
            chunk_kib: DEFAULT_CHUNK_KIB,
        }
    }
}

impl ResyncConfig {
    /// Pause when throttling
    pub fn throttle_sleep(&self) -> Duration {
        Duration::from_millis(self.throttle_sleep_ms)
    }
}

impl SupervisorConfig {
    /// Interval between sweeps
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Safe mode delay
    pub fn safemode_delay(&self) -> Duration {
        Duration::from_millis(self.safemode_delay_ms)
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // Resync speed limits
        if let Ok(min) = std::env::var("MDRAID_SPEED_LIMIT_MIN") {
            if let Ok(min) = min.trim().parse::<u64>() {
                self.resync.speed_limit_min = min;
            }
        }

        if let Ok(max) = std::env::var("MDRAID_SPEED_LIMIT_MAX") {
            if let Ok(max) = max.trim().parse::<u64>() {
                self.resync.speed_limit_max = max;
            }
        }

        // Supervisor
        if let Ok(interval) = std::env::var("MDRAID_SUPERVISOR_INTERVAL_MS") {
            if let Ok(ms) = interval.trim().parse::<u64>() {
                self.supervisor.interval_ms = ms;
            }
        }

        // Metadata format for new arrays
        if let Ok(format) = std::env::var("MDRAID_METADATA") {
            if let Ok(format) = format.parse::<MetadataFormat>() {
                self.metadata.format = format;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.resync.speed_limit_min == 0 {
            return Err(Error::InvalidConfig(
                "Minimum resync speed must be greater than 0".to_string(),
            ));
        }

        if self.resync.speed_limit_max < self.resync.speed_limit_min {
            return Err(Error::InvalidConfig(
                "Maximum resync speed is below the minimum".to_string(),
            ));
        }

        if self.supervisor.interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "Supervisor interval must be greater than 0".to_string(),
            ));
        }

        let chunk = u64::from(self.metadata.chunk_kib) * 1024;
        if !chunk.is_power_of_two() || !(4096..=4 * 1024 * 1024).contains(&chunk) {
            return Err(Error::InvalidConfig(format!(
                "Chunk size {} KiB must be a power of two between 4 KiB and 4 MiB",
                self.metadata.chunk_kib
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_md() {
        let config = Config::default();
        assert_eq!(config.resync.speed_limit_min, 1000);
        assert_eq!(config.resync.speed_limit_max, 200_000);
        assert_eq!(config.supervisor.interval(), Duration::from_secs(1));
        assert_eq!(config.supervisor.safemode_delay(), Duration::from_millis(200));
        assert_eq!(config.metadata.format, MetadataFormat::V1 { minor: 2 });
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.resync.speed_limit_max = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.metadata.chunk_kib = 48;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.resync.speed_limit_min = 5000;
        config.metadata.format = MetadataFormat::V090;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.metadata.format, MetadataFormat::V090);
        assert_eq!(loaded.resync.throttle_sleep(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.metadata.chunk_kib, DEFAULT_CHUNK_KIB);
        assert_eq!(config.resync.throttle_sleep_ms, 500);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
