//! config.rs
//! Instance configuration file (`trains_config.json`).
//!
//! ```json
//! { "trains": { "trainA": { "id": "trainA", "name": "Train A", "udp_port": 5555,
//!                           "mqtt_prefix": "trenes/trainA",
//!                           "pid_limits": { "kp_max": 250, "ki_max": 150, "kd_max": 150 },
//!                           "enabled": true } } }
//! ```
//!
//! A missing file yields the default three-train set. A file that exists but
//! does not parse is a configuration error.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "trains_config.json";
pub const DEFAULT_BASE_PORT: u16 = 5555;

fn default_reference_min() -> f64 {
    1.0
}

fn default_reference_max() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

/// Host-side upper bounds for outgoing PID commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidLimits {
    pub kp_max: f64,
    pub ki_max: f64,
    pub kd_max: f64,
    #[serde(default = "default_reference_min")]
    pub reference_min: f64,
    #[serde(default = "default_reference_max")]
    pub reference_max: f64,
}

impl Default for PidLimits {
    fn default() -> Self {
        Self {
            kp_max: 250.0,
            ki_max: 150.0,
            kd_max: 150.0,
            reference_min: default_reference_min(),
            reference_max: default_reference_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub id: String,
    pub name: String,
    pub udp_port: u16,
    pub mqtt_prefix: String,
    #[serde(default)]
    pub pid_limits: PidLimits,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TrainConfig {
    pub fn new(id: &str, name: &str, udp_port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            udp_port,
            mqtt_prefix: format!("trenes/{id}"),
            pid_limits: PidLimits::default(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub trains: BTreeMap<String, TrainConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let trains = [("trainA", "Train A"), ("trainB", "Train B"), ("trainC", "Train C")]
            .iter()
            .enumerate()
            .map(|(i, (id, name))| {
                (id.to_string(), TrainConfig::new(id, name, DEFAULT_BASE_PORT + i as u16))
            })
            .collect();
        Self { trains }
    }
}

impl PlatformConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("[CONFIG] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let config: PlatformConfig = serde_json::from_str(&text)
            .map_err(|e| PlatformError::Config(format!("{}: {}", path.display(), e)))?;
        for (key, train) in &config.trains {
            if key != &train.id {
                warn!("[CONFIG] entry {:?} has id {:?}; the id field wins", key, train.id);
            }
        }
        info!("[CONFIG] loaded {} train configurations", config.trains.len());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &TrainConfig> {
        self.trains.values().filter(|t| t.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_three_trains() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlatformConfig::load(&dir.path().join("nope.json")).unwrap();
        let ports: Vec<u16> = config.enabled().map(|t| t.udp_port).collect();
        assert_eq!(ports, vec![5555, 5556, 5557]);
        assert_eq!(config.trains["trainB"].mqtt_prefix, "trenes/trainB");
    }

    #[test]
    fn parses_original_layout() {
        let json = r#"{
            "admin_password": "ignored",
            "trains": {
                "trainA": {"id": "trainA", "name": "Train A", "udp_port": 6000,
                           "mqtt_prefix": "lab/a",
                           "pid_limits": {"kp_max": 100, "ki_max": 50, "kd_max": 20},
                           "enabled": false}
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, json).unwrap();

        let config = PlatformConfig::load(&path).unwrap();
        let a = &config.trains["trainA"];
        assert_eq!(a.pid_limits.kp_max, 100.0);
        assert_eq!(a.pid_limits.reference_max, 100.0);
        assert!(!a.enabled);
        assert_eq!(config.enabled().count(), 0);
    }

    #[test]
    fn dashboard_keys_are_ignored_and_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, r#"{"dashboard_host": "0.0.0.0", "dashboard_port": 8050, "trains": {}}"#).unwrap();
        let config = PlatformConfig::load(&path).unwrap();
        assert!(config.trains.is_empty());

        config.save(&path).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("dashboard"));
    }

    #[test]
    fn broken_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PlatformConfig::load(&path), Err(PlatformError::Config(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let config = PlatformConfig::default();
        config.save(&path).unwrap();
        assert_eq!(PlatformConfig::load(&path).unwrap(), config);
    }
}
