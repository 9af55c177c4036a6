// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Persists the serial port, sensor selection, control mode and per-fan
//! speeds and curves to TOML.
//! Default path: `/etc/gridctl/config.toml`

use crate::curve::FanCurveConfig;
use crate::grid::{FAN_COUNT, FanId};
use crate::polling::{ControlMode, FanControl, PollingSettings, TempSource};
use crate::sensors::{Aggregation, HWMON_ROOT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gridctl/config.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/gridctl.sock";

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Manual speed a fan starts at when nothing is configured.
pub const DEFAULT_MANUAL_PERCENT: u8 = 35;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Manual or automatic control at startup.
    #[serde(default)]
    pub mode: ControlMode,

    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Serial connection.
    #[serde(default)]
    pub serial: SerialConfig,

    /// Temperature sensor selection.
    #[serde(default)]
    pub sensors: SensorConfig,

    /// Per-fan settings. Fans not listed use defaults.
    #[serde(default)]
    pub fans: Vec<FanConfig>,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Poll interval for telemetry, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Path for the Unix domain socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port to connect to on startup (e.g. "/dev/ttyUSB0"). Unset means
    /// wait for a connect request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor ids (e.g. "hwmon2/temp1") aggregated into the CPU temperature.
    #[serde(default)]
    pub cpu: Vec<String>,

    /// Sensor ids aggregated into the GPU temperature.
    #[serde(default)]
    pub gpu: Vec<String>,

    #[serde(default)]
    pub cpu_aggregate: Aggregation,

    #[serde(default)]
    pub gpu_aggregate: Aggregation,

    #[serde(default = "default_hwmon_root")]
    pub hwmon_root: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            cpu: Vec::new(),
            gpu: Vec::new(),
            cpu_aggregate: Aggregation::Max,
            gpu_aggregate: Aggregation::Max,
            hwmon_root: HWMON_ROOT.to_string(),
        }
    }
}

/// Settings for one fan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanConfig {
    pub id: FanId,

    /// Speed used in manual mode, 0-100.
    #[serde(default = "default_manual_percent")]
    pub manual_percent: u8,

    /// Temperature that drives the curve in automatic mode.
    #[serde(default)]
    pub temp_source: TempSource,

    #[serde(default)]
    pub curve: FanCurveConfig,
}

impl FanConfig {
    pub fn new(id: FanId) -> Self {
        Self {
            id,
            manual_percent: DEFAULT_MANUAL_PERCENT,
            temp_source: TempSource::Cpu,
            curve: FanCurveConfig::default(),
        }
    }

    pub fn control(&self) -> FanControl {
        FanControl {
            curve: self.curve,
            temp_source: self.temp_source,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ControlMode::Manual,
            daemon: DaemonConfig::default(),
            serial: SerialConfig::default(),
            sensors: SensorConfig::default(),
            fans: FanId::ALL.into_iter().map(FanConfig::new).collect(),
        }
    }
}

impl Config {
    /// Settings for `id`, falling back to defaults if it isn't listed.
    pub fn fan(&self, id: FanId) -> FanConfig {
        self.fans
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .unwrap_or_else(|| FanConfig::new(id))
    }

    /// Mutable settings for `id`, inserting defaults if it isn't listed.
    pub fn fan_mut(&mut self, id: FanId) -> &mut FanConfig {
        let pos = match self.fans.iter().position(|f| f.id == id) {
            Some(pos) => pos,
            None => {
                self.fans.push(FanConfig::new(id));
                self.fans.len() - 1
            }
        };
        &mut self.fans[pos]
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_interval_ms)
    }

    pub fn manual_speeds(&self) -> [u8; FAN_COUNT] {
        FanId::ALL.map(|id| self.fan(id).manual_percent)
    }

    /// Polling engine settings derived from this config. Simulation is
    /// never persisted.
    pub fn polling_settings(&self) -> PollingSettings {
        PollingSettings {
            interval: self.poll_interval(),
            cpu_sensors: self.sensors.cpu.clone(),
            gpu_sensors: self.sensors.gpu.clone(),
            cpu_aggregate: self.sensors.cpu_aggregate,
            gpu_aggregate: self.sensors.gpu_aggregate,
            mode: self.mode,
            fans: FanId::ALL.map(|id| self.fan(id).control()),
            simulated: None,
        }
    }

    /// Check everything a running daemon relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.daemon.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than zero".to_string());
        }
        for (i, fan) in self.fans.iter().enumerate() {
            if self.fans[..i].iter().any(|f| f.id == fan.id) {
                return Err(format!("{} is configured more than once", fan.id));
            }
            if fan.manual_percent > 100 {
                return Err(format!(
                    "{}: manual_percent {} exceeds 100",
                    fan.id, fan.manual_percent
                ));
            }
            fan.curve.validate().map_err(|e| format!("{}: {e}", fan.id))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> io::Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse config: {e}"),
        )
    })?;

    config
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Invalid config: {e}")))?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize config: {e}"),
        )
    })?;

    fs::write(path, contents)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_hwmon_root() -> String {
    HWMON_ROOT.to_string()
}

fn default_manual_percent() -> u8 {
    DEFAULT_MANUAL_PERCENT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan(id: u8) -> FanId {
        FanId::new(id).unwrap()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.fans.len(), 6);
        assert_eq!(config.manual_speeds(), [35; FAN_COUNT]);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/config.toml");

        let mut config = Config::default();
        config.mode = ControlMode::Automatic;
        config.serial.port = Some("/dev/ttyUSB0".to_string());
        config.sensors.cpu = vec!["hwmon1/temp1".to_string(), "hwmon1/temp2".to_string()];
        config.sensors.gpu_aggregate = Aggregation::Average;
        config.fan_mut(fan(3)).manual_percent = 80;
        config.fan_mut(fan(3)).temp_source = TempSource::Gpu;
        config.fan_mut(fan(3)).curve.max_temp_c = 85.0;

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
mode = "automatic"

[serial]
port = "/dev/ttyACM0"

[sensors]
cpu = ["hwmon0/temp1"]

[[fans]]
id = 2
manual_percent = 50
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.mode, ControlMode::Automatic);
        assert_eq!(config.daemon.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.sensors.hwmon_root, HWMON_ROOT);
        assert_eq!(config.fans.len(), 1);
        assert_eq!(config.manual_speeds(), [35, 50, 35, 35, 35, 35]);
        assert_eq!(config.fan(fan(2)).curve, FanCurveConfig::default());

        let settings = config.polling_settings();
        assert_eq!(settings.cpu_sensors, vec!["hwmon0/temp1".to_string()]);
        assert_eq!(settings.mode, ControlMode::Automatic);
        assert!(settings.simulated.is_none());
    }

    #[test]
    fn test_rejects_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        fs::write(&path, "[[fans]]\nid = 7\n").unwrap();
        assert_eq!(
            load_config(&path).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        fs::write(&path, "[[fans]]\nid = 1\n\n[[fans]]\nid = 1\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "[daemon]\npoll_interval_ms = 0\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "not = [valid").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_validate_curves() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.fan_mut(fan(4)).curve.intermediate_speed_pct = 20;
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("fan 4"));

        let mut config = Config::default();
        config.fan_mut(fan(1)).manual_percent = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_config_path() {
        assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(
            resolve_config_path(Some("/tmp/grid.toml")),
            PathBuf::from("/tmp/grid.toml")
        );
    }
}
