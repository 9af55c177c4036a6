// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Background polling loop.
//!
//! Each cycle reads temperatures, optionally drives every fan from its
//! curve (automatic mode), reads RPM and voltage for all six fans and
//! publishes one [`PollingSnapshot`]. The loop sleeps until the next cycle
//! is due, measured from the start of the current one.
//!
//! Lifecycle: `Idle -> Running -> Stopping -> Idle`. [`PollingEngine::stop`]
//! cancels the loop and blocks until the thread has exited. An unexpected
//! error ends the loop, closes the serial port, returns the engine to
//! `Idle` and is published once as [`PollingEvent::Error`]; there is no
//! automatic restart.

use crate::curve::{FanCurveConfig, VoltageStep, voltage_for_percent};
use crate::error::{GridError, Result};
use crate::grid::{FAN_COUNT, FanId, FanVoltage, GridDevice};
use crate::sensors::{Aggregation, SensorSource, aggregate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Who decides fan speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Fixed per-fan percentages set from the foreground.
    #[default]
    Manual,
    /// The polling loop follows each fan's curve.
    Automatic,
}

/// Which aggregated temperature drives a fan's curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempSource {
    #[default]
    Cpu,
    Gpu,
}

/// Curve assignment for one fan.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FanControl {
    pub curve: FanCurveConfig,
    pub temp_source: TempSource,
}

/// Temperatures that replace the measured ones when driving curves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTemps {
    pub cpu_temp_c: f64,
    pub gpu_temp_c: f64,
}

/// Everything a cycle needs to know. Cloned at the start of each cycle,
/// so updates land on the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingSettings {
    pub interval: Duration,
    pub cpu_sensors: Vec<String>,
    pub gpu_sensors: Vec<String>,
    pub cpu_aggregate: Aggregation,
    pub gpu_aggregate: Aggregation,
    pub mode: ControlMode,
    pub fans: [FanControl; FAN_COUNT],
    pub simulated: Option<SimulatedTemps>,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            cpu_sensors: Vec::new(),
            gpu_sensors: Vec::new(),
            cpu_aggregate: Aggregation::Max,
            gpu_aggregate: Aggregation::Max,
            mode: ControlMode::Manual,
            fans: [FanControl::default(); FAN_COUNT],
            simulated: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Speed a fan was driven to in automatic mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanTarget {
    pub percent: u8,
    pub voltage: VoltageStep,
}

/// Coarse health of a fan, as shown by a status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanStatus {
    Running,
    Stopped,
    Unknown,
}

/// One fan's telemetry for a cycle. `None` means the batch read returned
/// no data, which is different from a reading of zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanReading {
    pub fan: FanId,
    pub rpm: Option<u16>,
    pub voltage: Option<FanVoltage>,
    pub target: Option<FanTarget>,
}

impl FanReading {
    pub fn status(&self) -> FanStatus {
        match (self.rpm, self.voltage) {
            (Some(0), Some(_)) => FanStatus::Stopped,
            (Some(_), Some(v)) if v.is_zero() => FanStatus::Stopped,
            (Some(_), Some(_)) => FanStatus::Running,
            _ => FanStatus::Unknown,
        }
    }
}

/// Everything one cycle observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSnapshot {
    /// One entry per fan, in fan order.
    pub fans: Vec<FanReading>,
    pub cpu_temp_c: f64,
    pub gpu_temp_c: f64,
    /// False when both aggregated temperatures are exactly zero.
    pub sensor_source_connected: bool,
    pub simulated: Option<SimulatedTemps>,
}

impl PollingSnapshot {
    pub fn fan(&self, fan: FanId) -> Option<&FanReading> {
        self.fans.iter().find(|r| r.fan == fan)
    }
}

/// Why the loop stopped on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingFailure {
    pub message: String,
    /// Cycles completed before the failure.
    pub cycles: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollingEvent {
    Snapshot(PollingSnapshot),
    Error(PollingFailure),
}

/// Receives what the loop produces: one snapshot per cycle and at most
/// one error per run.
pub trait TelemetrySink: Send + Sync + 'static {
    fn publish(&self, event: PollingEvent);
}

impl TelemetrySink for mpsc::Sender<PollingEvent> {
    fn publish(&self, event: PollingEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.send(event);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Stopping,
}

/// Cooperative cancellation with an interruptible sleep.
struct CancelToken {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    /// Sleep for `timeout` or until cancelled. Returns true if cancelled.
    fn sleep(&self, timeout: Duration) -> bool {
        let guard = lock(&self.cancelled);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<CancelToken>,
}

/// What the loop thread owns.
struct LoopContext {
    device: GridDevice,
    sensors: Arc<dyn SensorSource>,
    settings: Arc<Mutex<PollingSettings>>,
    state: Arc<Mutex<EngineState>>,
    sink: Arc<dyn TelemetrySink>,
    cancel: Arc<CancelToken>,
}

pub struct PollingEngine {
    device: GridDevice,
    sensors: Arc<dyn SensorSource>,
    settings: Arc<Mutex<PollingSettings>>,
    state: Arc<Mutex<EngineState>>,
    sink: Arc<dyn TelemetrySink>,
    worker: Option<Worker>,
}

impl PollingEngine {
    pub fn new(
        device: GridDevice,
        sensors: Arc<dyn SensorSource>,
        settings: PollingSettings,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            device,
            sensors,
            settings: Arc::new(Mutex::new(settings)),
            state: Arc::new(Mutex::new(EngineState::Idle)),
            sink,
            worker: None,
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Start polling every `interval`. Fails if a loop is already running.
    pub fn start(&mut self, interval: Duration) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            if self.state() != EngineState::Idle {
                self.worker = Some(worker);
                return Err(GridError::AlreadyRunning);
            }
            // The previous loop ended on an error; reap it.
            join_worker(worker);
        }

        lock(&self.settings).interval = interval;
        *lock(&self.state) = EngineState::Running;

        let cancel = Arc::new(CancelToken::new());
        let ctx = LoopContext {
            device: self.device.clone(),
            sensors: self.sensors.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            sink: self.sink.clone(),
            cancel: cancel.clone(),
        };

        let handle = thread::Builder::new()
            .name("grid-poll".to_string())
            .spawn(move || run_loop(ctx))
            .map_err(|e| {
                *lock(&self.state) = EngineState::Idle;
                GridError::Thread(e.to_string())
            })?;

        self.worker = Some(Worker { handle, cancel });
        log::info!("Polling started ({} ms interval)", interval.as_millis());
        Ok(())
    }

    /// Stop the loop after its current cycle and wait for the thread to
    /// exit. Nothing is in flight on the serial channel once this returns.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = lock(&self.state);
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
            }
        }
        worker.cancel.cancel();
        join_worker(worker);
        *lock(&self.state) = EngineState::Idle;
        log::info!("Polling stopped");
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> PollingSettings {
        lock(&self.settings).clone()
    }

    pub fn interval(&self) -> Duration {
        lock(&self.settings).interval
    }

    /// Replace every setting at once, e.g. after a config reload.
    pub fn replace_settings(&self, settings: PollingSettings) {
        *lock(&self.settings) = settings;
    }

    pub fn update_interval(&self, interval: Duration) {
        lock(&self.settings).interval = interval;
    }

    pub fn update_sensor_selection(&self, cpu: Vec<String>, gpu: Vec<String>) {
        let mut settings = lock(&self.settings);
        settings.cpu_sensors = cpu;
        settings.gpu_sensors = gpu;
    }

    pub fn update_aggregation(&self, cpu: Aggregation, gpu: Aggregation) {
        let mut settings = lock(&self.settings);
        settings.cpu_aggregate = cpu;
        settings.gpu_aggregate = gpu;
    }

    pub fn set_mode(&self, mode: ControlMode) {
        lock(&self.settings).mode = mode;
    }

    pub fn set_fan_control(&self, fan: FanId, control: FanControl) {
        lock(&self.settings).fans[fan.index()] = control;
    }

    pub fn set_simulated(&self, simulated: Option<SimulatedTemps>) {
        lock(&self.settings).simulated = simulated;
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(worker: Worker) {
    if worker.handle.join().is_err() {
        log::error!("Polling thread panicked");
    }
}

fn run_loop(ctx: LoopContext) {
    let mut cycles = 0u64;

    while !ctx.cancel.is_cancelled() {
        let started = Instant::now();
        let settings = lock(&ctx.settings).clone();

        match run_cycle(&ctx, &settings) {
            Ok(snapshot) => ctx.sink.publish(PollingEvent::Snapshot(snapshot)),
            Err(e) => {
                log::error!("Polling stopped after {cycles} cycle(s): {e}");
                // The device state is unknown; end the session.
                ctx.device.channel().close();
                *lock(&ctx.state) = EngineState::Idle;
                ctx.sink.publish(PollingEvent::Error(PollingFailure {
                    message: e.to_string(),
                    cycles,
                }));
                return;
            }
        }
        cycles += 1;

        let remaining = settings.interval.saturating_sub(started.elapsed());
        if ctx.cancel.sleep(remaining) {
            break;
        }
    }

    *lock(&ctx.state) = EngineState::Idle;
}

fn run_cycle(ctx: &LoopContext, settings: &PollingSettings) -> Result<PollingSnapshot> {
    let mut ids = settings.cpu_sensors.clone();
    ids.extend(settings.gpu_sensors.iter().cloned());
    ids.sort();
    ids.dedup();

    let readings = if ids.is_empty() {
        HashMap::new()
    } else {
        ctx.sensors.read_temperatures(&ids)?
    };
    let cpu_temp_c = aggregate(&readings, &settings.cpu_sensors, settings.cpu_aggregate);
    let gpu_temp_c = aggregate(&readings, &settings.gpu_sensors, settings.gpu_aggregate);

    let mut targets = [None; FAN_COUNT];
    if settings.mode == ControlMode::Automatic {
        let (cpu, gpu) = match settings.simulated {
            Some(sim) => (sim.cpu_temp_c, sim.gpu_temp_c),
            None => (cpu_temp_c, gpu_temp_c),
        };
        for fan in FanId::ALL {
            let control = &settings.fans[fan.index()];
            let temp_c = match control.temp_source {
                TempSource::Cpu => cpu,
                TempSource::Gpu => gpu,
            };
            let percent = control.curve.percent_for_temperature(temp_c);
            let voltage = voltage_for_percent(percent);
            ctx.device.set_fan_voltage(fan, voltage)?;
            targets[fan.index()] = Some(FanTarget { percent, voltage });
        }
    }

    let rpm = ctx.device.read_fan_rpm()?;
    let voltage = ctx.device.read_fan_voltage()?;

    let fans = FanId::ALL
        .into_iter()
        .map(|fan| FanReading {
            fan,
            rpm: rpm.map(|r| r[fan.index()]),
            voltage: voltage.map(|v| v[fan.index()]),
            target: targets[fan.index()],
        })
        .collect();

    Ok(PollingSnapshot {
        fans,
        cpu_temp_c,
        gpu_temp_c,
        sensor_source_connected: !(cpu_temp_c == 0.0 && gpu_temp_c == 0.0),
        simulated: settings.simulated,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sensors::HwmonSensors;
    use crate::serial::mock::MockGrid;

    const WAIT: Duration = Duration::from_secs(5);

    /// Sensor source with fixed values; can be switched into a failing state.
    pub(crate) struct FakeSensors {
        pub values: Mutex<HashMap<String, f64>>,
        pub broken: Mutex<bool>,
    }

    impl FakeSensors {
        pub fn new(values: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(values.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                broken: Mutex::new(false),
            })
        }
    }

    impl SensorSource for FakeSensors {
        fn read_temperatures(&self, ids: &[String]) -> Result<HashMap<String, f64>> {
            if *self.broken.lock().unwrap() {
                return Err(GridError::Sensor("provider went away".to_string()));
            }
            let values = self.values.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| values.get(id).map(|v| (id.clone(), *v)))
                .collect())
        }
    }

    fn settings() -> PollingSettings {
        PollingSettings {
            interval: Duration::from_millis(20),
            cpu_sensors: vec!["cpu/0".to_string(), "cpu/1".to_string()],
            gpu_sensors: vec!["gpu/0".to_string()],
            ..PollingSettings::default()
        }
    }

    fn engine(
        grid: &MockGrid,
        sensors: Arc<FakeSensors>,
        settings: PollingSettings,
    ) -> (PollingEngine, mpsc::Receiver<PollingEvent>) {
        let (tx, rx) = mpsc::channel();
        let device = GridDevice::new(Arc::new(grid.channel()));
        (PollingEngine::new(device, sensors, settings, Arc::new(tx)), rx)
    }

    fn next_snapshot(rx: &mpsc::Receiver<PollingEvent>) -> PollingSnapshot {
        match rx.recv_timeout(WAIT).expect("no event from polling loop") {
            PollingEvent::Snapshot(s) => s,
            PollingEvent::Error(e) => panic!("unexpected polling error: {}", e.message),
        }
    }

    #[test]
    fn test_snapshot_reports_fans_and_temps() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 41.0), ("cpu/1", 55.0), ("gpu/0", 62.5)]);
        let (mut engine, rx) = engine(&grid, sensors, settings());

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        assert_eq!(snap.cpu_temp_c, 55.0);
        assert_eq!(snap.gpu_temp_c, 62.5);
        assert!(snap.sensor_source_connected);
        assert_eq!(snap.fans.len(), 6);

        let fan1 = snap.fan(FanId::new(1).unwrap()).unwrap();
        assert_eq!(fan1.rpm, Some(1200));
        assert_eq!(fan1.status(), FanStatus::Running);
        assert_eq!(fan1.target, None);

        let fan6 = snap.fan(FanId::new(6).unwrap()).unwrap();
        assert_eq!(fan6.rpm, Some(0));
        assert_eq!(fan6.status(), FanStatus::Stopped);

        // Manual mode never writes a set-voltage frame.
        assert!(grid.writes().iter().all(|w| w[0] != 0x44));
    }

    #[test]
    fn test_average_aggregation() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 40.0), ("cpu/1", 50.0)]);
        let mut cfg = settings();
        cfg.cpu_aggregate = Aggregation::Average;
        let (mut engine, rx) = engine(&grid, sensors, cfg);

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        assert_eq!(snap.cpu_temp_c, 45.0);
        assert_eq!(snap.gpu_temp_c, 0.0);
        assert!(snap.sensor_source_connected);
    }

    #[test]
    fn test_no_temperatures_reads_as_disconnected() {
        let grid = MockGrid::new();
        let (mut engine, rx) = engine(&grid, FakeSensors::new(&[]), settings());

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        assert_eq!((snap.cpu_temp_c, snap.gpu_temp_c), (0.0, 0.0));
        assert!(!snap.sensor_source_connected);
    }

    #[test]
    fn test_automatic_mode_drives_curves() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 50.0), ("gpu/0", 80.0)]);
        let mut cfg = settings();
        cfg.mode = ControlMode::Automatic;
        cfg.fans[1].temp_source = TempSource::Gpu;
        let (mut engine, rx) = engine(&grid, sensors, cfg);

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        // Default curve: 50C -> 48% -> 6.0V; 80C is past the max -> 100% -> 12.0V
        let fan1 = snap.fan(FanId::new(1).unwrap()).unwrap().target.unwrap();
        assert_eq!(fan1.percent, 48);
        assert_eq!(fan1.voltage.volts(), 6.0);
        let fan2 = snap.fan(FanId::new(2).unwrap()).unwrap().target.unwrap();
        assert_eq!(fan2.percent, 100);
        assert_eq!(fan2.voltage, VoltageStep::MAX);

        let writes = grid.writes();
        assert_eq!(&writes[0], &[0x44, 0x01, 0xC0, 0x00, 0x00, 0x06, 0x00]);
        assert_eq!(&writes[1], &[0x44, 0x02, 0xC0, 0x00, 0x00, 0x0C, 0x00]);
        // Set-voltage for all six fans precedes the RPM batch.
        assert_eq!(writes[6], vec![0x8A, 0x01]);
    }

    #[test]
    fn test_simulated_temperatures_drive_curves() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 30.0)]);
        let mut cfg = settings();
        cfg.mode = ControlMode::Automatic;
        cfg.simulated = Some(SimulatedTemps {
            cpu_temp_c: 90.0,
            gpu_temp_c: 90.0,
        });
        let (mut engine, rx) = engine(&grid, sensors, cfg);

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        assert_eq!(snap.cpu_temp_c, 30.0);
        assert!(snap.simulated.is_some());
        assert!(snap.fans.iter().all(|f| f.target.unwrap().percent == 100));
    }

    #[test]
    fn test_no_data_keeps_loop_running() {
        let grid = MockGrid::new();
        grid.with(|s| s.corrupt_fan = Some(3));
        let (mut engine, rx) = engine(&grid, FakeSensors::new(&[]), settings());

        engine.start(Duration::from_millis(20)).unwrap();
        let first = next_snapshot(&rx);
        let second = next_snapshot(&rx);
        engine.stop();

        for snap in [first, second] {
            assert!(snap.fans.iter().all(|f| f.rpm.is_none() && f.voltage.is_none()));
            assert!(snap.fans.iter().all(|f| f.status() == FanStatus::Unknown));
        }
    }

    #[test]
    fn test_unexpected_error_ends_loop_once() {
        let grid = MockGrid::new();
        let (mut engine, rx) = engine(&grid, FakeSensors::new(&[]), settings());

        engine.start(Duration::from_millis(20)).unwrap();
        next_snapshot(&rx);
        grid.with(|s| s.unplugged = true);

        let failure = loop {
            match rx.recv_timeout(WAIT).expect("loop never failed") {
                PollingEvent::Snapshot(_) => continue,
                PollingEvent::Error(e) => break e,
            }
        };
        assert!(failure.message.contains("I/O error"));
        assert!(failure.cycles >= 1);

        // No restart, no second error, and the port is closed.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.device.channel().is_open());

        // A new session can start once the device is back.
        grid.with(|s| s.unplugged = false);
        engine.device.channel().open().unwrap();
        engine.start(Duration::from_millis(20)).unwrap();
        next_snapshot(&rx);
        engine.stop();
    }

    #[test]
    fn test_empty_selection_skips_sensor_source() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[]);
        *sensors.broken.lock().unwrap() = true;
        let mut cfg = settings();
        cfg.cpu_sensors.clear();
        cfg.gpu_sensors.clear();
        let (mut engine, rx) = engine(&grid, sensors, cfg);

        engine.start(Duration::from_millis(20)).unwrap();
        let snap = next_snapshot(&rx);
        engine.stop();

        assert!(!snap.sensor_source_connected);
        assert_eq!(snap.fan(FanId::new(1).unwrap()).unwrap().rpm, Some(1200));
    }

    #[test]
    fn test_missing_hwmon_root_reads_as_disconnected() {
        let grid = MockGrid::new();
        let (tx, rx) = mpsc::channel();
        let device = GridDevice::new(Arc::new(grid.channel()));
        let sensors = Arc::new(HwmonSensors::new("/nonexistent/hwmon"));
        for cfg in [PollingSettings::default(), settings()] {
            let mut engine =
                PollingEngine::new(device.clone(), sensors.clone(), cfg, Arc::new(tx.clone()));
            engine.start(Duration::from_millis(20)).unwrap();
            let snap = next_snapshot(&rx);
            engine.stop();

            assert!(!snap.sensor_source_connected);
            assert_eq!((snap.cpu_temp_c, snap.gpu_temp_c), (0.0, 0.0));
            assert!(snap.fans.iter().all(|f| f.rpm.is_some()));
        }
    }

    #[test]
    fn test_sensor_failure_is_terminal() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 40.0)]);
        *sensors.broken.lock().unwrap() = true;
        let (mut engine, rx) = engine(&grid, sensors, settings());

        engine.start(Duration::from_millis(20)).unwrap();
        match rx.recv_timeout(WAIT).unwrap() {
            PollingEvent::Error(e) => {
                assert_eq!(e.cycles, 0);
                assert!(e.message.contains("provider went away"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_stop_between_cycles_then_restart() {
        let grid = MockGrid::new();
        let (mut engine, rx) = engine(&grid, FakeSensors::new(&[]), settings());

        engine.start(Duration::from_secs(30)).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        next_snapshot(&rx);

        // The loop is sleeping out a 30s interval; stop must not wait for it.
        let asked = Instant::now();
        engine.stop();
        assert!(asked.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.state(), EngineState::Idle);

        let writes_after_stop = grid.writes().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(grid.writes().len(), writes_after_stop);

        engine.start(Duration::from_millis(20)).unwrap();
        next_snapshot(&rx);
        engine.stop();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let grid = MockGrid::new();
        let (mut engine, _rx) = engine(&grid, FakeSensors::new(&[]), settings());

        engine.start(Duration::from_millis(20)).unwrap();
        assert!(matches!(
            engine.start(Duration::from_millis(20)),
            Err(GridError::AlreadyRunning)
        ));
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_sensor_selection_applies_next_cycle() {
        let grid = MockGrid::new();
        let sensors = FakeSensors::new(&[("cpu/0", 40.0), ("other", 70.0)]);
        let (mut engine, rx) = engine(&grid, sensors, settings());

        engine.start(Duration::from_millis(20)).unwrap();
        assert_eq!(next_snapshot(&rx).cpu_temp_c, 40.0);

        engine.update_sensor_selection(vec!["other".to_string()], Vec::new());
        let updated = loop {
            let snap = next_snapshot(&rx);
            if snap.cpu_temp_c != 40.0 {
                break snap;
            }
        };
        engine.stop();
        assert_eq!(updated.cpu_temp_c, 70.0);
        assert_eq!(engine.settings().cpu_sensors, vec!["other".to_string()]);
    }

    #[test]
    fn test_fan_status() {
        let reading = |rpm, voltage| FanReading {
            fan: FanId::new(1).unwrap(),
            rpm,
            voltage,
            target: None,
        };
        let on = FanVoltage { whole: 7, fraction: 50 };
        let off = FanVoltage::default();
        assert_eq!(reading(Some(900), Some(on)).status(), FanStatus::Running);
        assert_eq!(reading(Some(0), Some(on)).status(), FanStatus::Stopped);
        assert_eq!(reading(Some(900), Some(off)).status(), FanStatus::Stopped);
        assert_eq!(reading(None, Some(on)).status(), FanStatus::Unknown);
        assert_eq!(reading(Some(900), None).status(), FanStatus::Unknown);
    }
}
