// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature sources for the polling engine.
//!
//! The engine asks a [`SensorSource`] for the current value of a set of
//! sensor ids and gets back whatever it could read; ids with no reading
//! are simply absent. [`HwmonSensors`] reads ids of the form
//! `hwmon3/temp1` from sysfs.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default sysfs hwmon root.
pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Supplies temperature readings keyed by sensor id.
pub trait SensorSource: Send + Sync {
    /// Current temperatures (degrees C) for `ids`. Unknown or unreadable
    /// ids are skipped; an `Err` means the source itself is gone.
    fn read_temperatures(&self, ids: &[String]) -> Result<HashMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// hwmon
// ---------------------------------------------------------------------------

/// Reads `<root>/hwmonN/tempM_input` (millidegrees C) for id `hwmonN/tempM`.
#[derive(Debug, Clone)]
pub struct HwmonSensors {
    root: PathBuf,
}

impl HwmonSensors {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn input_path(&self, id: &str) -> Option<PathBuf> {
        let (device, channel) = id.split_once('/')?;
        if device.is_empty() || channel.is_empty() || device.contains("..") || channel.contains('/') {
            return None;
        }
        Some(self.root.join(device).join(format!("{channel}_input")))
    }
}

impl Default for HwmonSensors {
    fn default() -> Self {
        Self::new(HWMON_ROOT)
    }
}

impl SensorSource for HwmonSensors {
    fn read_temperatures(&self, ids: &[String]) -> Result<HashMap<String, f64>> {
        if !self.root.is_dir() {
            log::debug!("hwmon root {} not available", self.root.display());
            return Ok(HashMap::new());
        }

        let mut map = HashMap::new();
        for id in ids {
            let Some(path) = self.input_path(id) else {
                log::debug!("Ignoring malformed sensor id {id}");
                continue;
            };
            if let Some(temp_c) = read_millidegrees(&path) {
                map.insert(id.clone(), temp_c);
            }
        }
        Ok(map)
    }
}

fn read_millidegrees(path: &Path) -> Option<f64> {
    read_trimmed(path)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|millic| millic as f64 / 1000.0)
}

fn read_trimmed(path: &Path) -> io::Result<String> {
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// How the readings of a sensor group combine into one temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Max,
    Average,
}

/// Combine the readings for `ids`. No configured ids, or none of them
/// present in `readings`, gives 0.
pub fn aggregate(readings: &HashMap<String, f64>, ids: &[String], mode: Aggregation) -> f64 {
    let values: Vec<f64> = ids.iter().filter_map(|id| readings.get(id).copied()).collect();
    if values.is_empty() {
        return 0.0;
    }
    match mode {
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Average => values.iter().sum::<f64>() / values.len() as f64,
    }
}
