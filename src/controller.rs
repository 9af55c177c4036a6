// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Session orchestration.
//!
//! [`GridController`] ties the serial channel, the polling engine and the
//! command dispatcher together and enforces their ordering: the engine is
//! always stopped before the port is closed or reconfigured, and only
//! started after the handshake succeeded.

use crate::curve::VoltageStep;
use crate::dispatcher::CommandDispatcher;
use crate::error::{GridError, Result};
use crate::grid::{FAN_COUNT, FanId, GridDevice};
use crate::polling::{
    ControlMode, EngineState, FanControl, PollingEngine, PollingSettings, SimulatedTemps,
    TelemetrySink,
};
use crate::sensors::{Aggregation, SensorSource};
use crate::serial::{PortConfig, SerialChannel};
use std::sync::Arc;
use std::time::Duration;

pub struct GridController {
    channel: Arc<SerialChannel>,
    dispatcher: CommandDispatcher,
    engine: PollingEngine,
    manual_speeds: [u8; FAN_COUNT],
}

impl GridController {
    pub fn new(
        channel: Arc<SerialChannel>,
        sensors: Arc<dyn SensorSource>,
        settings: PollingSettings,
        manual_speeds: [u8; FAN_COUNT],
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let device = GridDevice::new(channel.clone());
        Self {
            channel,
            dispatcher: CommandDispatcher::new(device.clone()),
            engine: PollingEngine::new(device, sensors, settings, sink),
            manual_speeds,
        }
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Open `port`, run the handshake, push the manual speeds and start
    /// polling. Any session already running is torn down first.
    pub fn connect(&mut self, port: &str) -> Result<()> {
        self.teardown();
        self.channel.configure(PortConfig::new(port));
        self.open_session()
    }

    /// Re-run the connect sequence on the current port.
    pub fn reconnect(&mut self) -> Result<()> {
        let port = self.channel.port_name().ok_or(GridError::PortNotConfigured)?;
        self.connect(&port)
    }

    /// Stop polling and close the port. The port name is remembered.
    pub fn disconnect(&mut self) {
        self.teardown();
        log::info!("Disconnected");
    }

    fn teardown(&mut self) {
        self.engine.stop();
        self.channel.close();
    }

    fn open_session(&mut self) -> Result<()> {
        self.channel.open()?;

        if let Err(e) = self.dispatcher.device().initialize() {
            self.channel.close();
            return Err(e);
        }

        if let Err(e) = self.dispatcher.apply_speeds(&self.manual_speeds) {
            self.channel.close();
            return Err(e);
        }

        let interval = self.engine.interval();
        if let Err(e) = self.engine.start(interval) {
            self.channel.close();
            return Err(e);
        }

        log::info!(
            "Connected to {}",
            self.channel.port_name().unwrap_or_default()
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    pub fn port(&self) -> Option<String> {
        self.channel.port_name()
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Change the polling interval. A live session is restarted so the new
    /// interval takes effect from a fresh handshake.
    pub fn set_poll_interval(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(GridError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        self.engine.update_interval(interval);
        if self.is_connected() {
            self.reconnect()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fan control
    // -----------------------------------------------------------------------

    pub fn mode(&self) -> ControlMode {
        self.engine.settings().mode
    }

    /// Switch between manual and automatic control. Returning to manual
    /// re-applies the stored manual speeds.
    pub fn set_mode(&mut self, mode: ControlMode) -> Result<()> {
        self.engine.set_mode(mode);
        log::info!("Control mode set to {mode:?}");
        if mode == ControlMode::Manual && self.is_connected() {
            self.dispatcher.apply_speeds(&self.manual_speeds)?;
        }
        Ok(())
    }

    pub fn manual_speeds(&self) -> [u8; FAN_COUNT] {
        self.manual_speeds
    }

    /// Store a manual speed and, in manual mode with a live session, send
    /// it. In automatic mode the value is kept for later but rejected.
    pub fn set_manual_speed(&mut self, fan: FanId, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(GridError::InvalidConfig(format!(
                "speed {percent}% is out of range 0-100"
            )));
        }
        self.manual_speeds[fan.index()] = percent;
        if self.mode() == ControlMode::Automatic {
            return Err(GridError::AutomaticModeActive);
        }
        if self.is_connected() {
            self.dispatcher.set_fan_speed(fan, percent)?;
        }
        Ok(())
    }

    /// Drive a fan at the supported voltage nearest to `volts`. Manual mode
    /// only; requires a live session.
    pub fn set_fan_voltage(&self, fan: FanId, volts: f64) -> Result<VoltageStep> {
        if self.mode() == ControlMode::Automatic {
            return Err(GridError::AutomaticModeActive);
        }
        self.dispatcher.set_fan_voltage(fan, volts)
    }

    pub fn set_fan_control(&self, fan: FanId, control: FanControl) -> Result<()> {
        control.curve.validate().map_err(GridError::InvalidConfig)?;
        self.engine.set_fan_control(fan, control);
        Ok(())
    }

    pub fn set_sensor_selection(&self, cpu: Vec<String>, gpu: Vec<String>) {
        self.engine.update_sensor_selection(cpu, gpu);
    }

    pub fn set_aggregation(&self, cpu: Aggregation, gpu: Aggregation) {
        self.engine.update_aggregation(cpu, gpu);
    }

    pub fn simulate(&self, simulated: Option<SimulatedTemps>) {
        match simulated {
            Some(sim) => log::info!(
                "Simulating CPU {:.1}C / GPU {:.1}C",
                sim.cpu_temp_c,
                sim.gpu_temp_c
            ),
            None => log::info!("Simulation off"),
        }
        self.engine.set_simulated(simulated);
    }

    pub fn settings(&self) -> PollingSettings {
        self.engine.settings()
    }

    /// Swap in freshly loaded settings. A changed interval restarts a live
    /// session; otherwise manual speeds are re-sent when in manual mode.
    pub fn apply(&mut self, settings: PollingSettings, manual_speeds: [u8; FAN_COUNT]) -> Result<()> {
        let interval_changed = settings.interval != self.engine.interval();
        let mode = settings.mode;
        self.engine.replace_settings(settings);
        self.manual_speeds = manual_speeds;

        if !self.is_connected() {
            return Ok(());
        }
        if interval_changed {
            self.reconnect()
        } else if mode == ControlMode::Manual {
            self.dispatcher.apply_speeds(&self.manual_speeds)
        } else {
            Ok(())
        }
    }
}

impl Drop for GridController {
    fn drop(&mut self) {
        self.teardown();
    }
}
