// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Client-daemon protocol over Unix domain sockets.
//!
//! Messages are newline-delimited JSON. The client sends a [`Request`]
//! and the daemon replies with a [`Response`]. After `subscribe` the daemon
//! keeps pushing one `snapshot` per polling cycle, plus an `error` if the
//! loop stops on its own.

use crate::curve::FanCurveConfig;
use crate::grid::FanId;
use crate::polling::{
    ControlMode, EngineState, PollingFailure, PollingSnapshot, SimulatedTemps, TempSource,
};
use crate::sensors::Aggregation;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests (CLI -> Daemon)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Connection state, settings and the latest snapshot.
    #[serde(rename = "get_status")]
    GetStatus,

    /// Serial ports present on the system.
    #[serde(rename = "list_ports")]
    ListPorts,

    /// Open a port and start a session.
    #[serde(rename = "connect")]
    Connect { port: String },

    /// Stop polling and close the port.
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Change the polling interval. Restarts a live session.
    #[serde(rename = "set_poll_interval")]
    SetPollInterval { interval_ms: u64 },

    #[serde(rename = "set_mode")]
    SetMode { mode: ControlMode },

    /// Manual speed for one fan, 0-100.
    #[serde(rename = "set_manual")]
    SetManual { fan: FanId, percent: u8 },

    /// Drive one fan at the supported voltage nearest to `volts`.
    #[serde(rename = "set_voltage")]
    SetVoltage { fan: FanId, volts: f64 },

    /// Curve and temperature source for one fan.
    #[serde(rename = "set_curve")]
    SetCurve {
        fan: FanId,
        curve: FanCurveConfig,
        temp_source: TempSource,
    },

    /// Replace the CPU and GPU sensor groups.
    #[serde(rename = "set_sensors")]
    SetSensors { cpu: Vec<String>, gpu: Vec<String> },

    #[serde(rename = "set_aggregation")]
    SetAggregation { cpu: Aggregation, gpu: Aggregation },

    /// Drive curves from fixed temperatures instead of the sensors.
    #[serde(rename = "simulate")]
    Simulate { cpu_temp_c: f64, gpu_temp_c: f64 },

    #[serde(rename = "stop_simulation")]
    StopSimulation,

    /// Save current configuration to disk.
    #[serde(rename = "save_config")]
    SaveConfig,

    /// Reload configuration from disk.
    #[serde(rename = "reload_config")]
    ReloadConfig,

    /// Request the daemon to push every snapshot.
    #[serde(rename = "subscribe")]
    Subscribe,
}

// ---------------------------------------------------------------------------
// Responses (Daemon -> CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Current daemon status.
    #[serde(rename = "status")]
    Status(StatusInfo),

    /// One polling cycle.
    #[serde(rename = "snapshot")]
    Snapshot { snapshot: PollingSnapshot },

    /// Available serial ports.
    #[serde(rename = "ports")]
    Ports { ports: Vec<String> },

    /// Operation succeeded.
    #[serde(rename = "ok")]
    Ok { message: String },

    /// Operation failed.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Everything `get_status` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub connected: bool,
    pub port: Option<String>,
    pub engine: EngineState,
    pub mode: ControlMode,
    pub poll_interval_ms: u64,
    pub manual_speeds: Vec<u8>,
    pub fans: Vec<FanSettingsInfo>,
    pub cpu_sensors: Vec<String>,
    pub gpu_sensors: Vec<String>,
    pub cpu_aggregate: Aggregation,
    pub gpu_aggregate: Aggregation,
    pub simulated: Option<SimulatedTemps>,
    pub snapshot: Option<PollingSnapshot>,
    /// Why the last session's polling loop stopped, if it did.
    pub last_error: Option<PollingFailure>,
}

/// Curve assignment info sent in status messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSettingsInfo {
    pub fan: FanId,
    pub temp_source: TempSource,
    pub curve: FanCurveConfig,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Encode a message as a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(msg)?;
    s.push('\n');
    Ok(s)
}

/// Decode a message from a JSON string (newline-trimmed).
pub fn decode<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(s.trim())
}
