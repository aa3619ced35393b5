//! Configuration management for the Horizon replication server.
//!
//! Loads the host settings and the embedded replication graph configuration
//! from a TOML file and validates them before the tick loop starts.

use horizon_repgraph::GraphConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

fn default_stats_interval() -> u64 {
    60
}

fn default_client_rate() -> u64 {
    // Typical per-client game traffic cap
    10_000
}

fn default_seed() -> u64 {
    0x4859_5a4e
}

/// Graph defaults with the bucket fast path on, so fast-shared classes use it.
fn default_replication() -> GraphConfig {
    let mut replication = GraphConfig::default();
    replication.frequency_buckets.enable_fast_path = true;
    replication
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    #[serde(default = "default_replication")]
    pub replication: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Seconds between health reports
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Objects spawned into the simulated world
    pub simulated_objects: usize,
    /// Simulated clients connected at startup
    pub simulated_clients: usize,
    /// Bytes per second each simulated client can drain
    #[serde(default = "default_client_rate")]
    pub client_rate_bytes_per_sec: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub region: RegionSettings,
}

/// World-space box the simulation spawns and wanders in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSettings {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                stats_interval_secs: default_stats_interval(),
                simulated_objects: 2_000,
                simulated_clients: 16,
                client_rate_bytes_per_sec: default_client_rate(),
                seed: default_seed(),
                region: RegionSettings {
                    min_x: -50_000.0,
                    max_x: 50_000.0,
                    min_y: -50_000.0,
                    max_y: 50_000.0,
                    min_z: 0.0,
                    max_z: 2_000.0,
                },
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
            replication: default_replication(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing the defaults to `path`
    /// when it does not exist yet.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks host settings and the replication graph configuration.
    pub fn validate(&self) -> Result<(), String> {
        let region = &self.server.region;
        if region.min_x >= region.max_x {
            return Err("Region min_x must be less than max_x".to_string());
        }
        if region.min_y >= region.max_y {
            return Err("Region min_y must be less than max_y".to_string());
        }
        if region.min_z > region.max_z {
            return Err("Region min_z must not exceed max_z".to_string());
        }

        if self.server.stats_interval_secs == 0 {
            return Err("server.stats_interval_secs must be greater than 0".to_string());
        }
        if self.server.client_rate_bytes_per_sec == 0 {
            return Err("server.client_rate_bytes_per_sec must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        self.replication
            .validate()
            .map_err(|e| format!("Invalid replication config: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.stats_interval_secs, 60);
        assert_eq!(config.server.client_rate_bytes_per_sec, 10_000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert_eq!(config.replication.general.server_tick_rate, 30.0);
        assert!(config.replication.frequency_buckets.enable_fast_path);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.region.min_x = 100.0;
        config.server.region.max_x = 50.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.stats_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_includes_replication_settings() {
        let mut config = AppConfig::default();
        config.replication.general.server_tick_rate = 0.0;
        let error = config.validate().unwrap_err();
        assert!(error.contains("replication"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let content = r#"
            [server]
            simulated_objects = 10
            simulated_clients = 2

            [server.region]
            min_x = 0.0
            max_x = 1000.0
            min_y = 0.0
            max_y = 1000.0
            min_z = 0.0
            max_z = 0.0

            [logging]
            level = "debug"
            json_format = true

            [replication.grid]
            cell_size = 500.0
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();

        assert_eq!(config.server.simulated_objects, 10);
        assert_eq!(config.server.stats_interval_secs, 60);
        assert_eq!(config.replication.grid.cell_size, 500.0);
        assert_eq!(config.replication.general.server_tick_rate, 30.0);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("horizon.toml");

        let created = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.server.simulated_objects, created.server.simulated_objects);
        assert_eq!(loaded.replication.grid.cell_size, created.replication.grid.cell_size);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[server\nsimulated_objects = ").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }
}
