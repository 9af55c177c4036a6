// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Foreground fan commands.
//!
//! Commands go through the same [`GridDevice`] as the polling loop, so
//! they queue behind whatever exchange is holding the serial channel and
//! never interleave with it.

use crate::curve::{VoltageStep, voltage_for_percent};
use crate::error::Result;
use crate::grid::{FAN_COUNT, FanId, GridDevice};

#[derive(Clone)]
pub struct CommandDispatcher {
    device: GridDevice,
}

impl CommandDispatcher {
    pub fn new(device: GridDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &GridDevice {
        &self.device
    }

    /// Set a fan from a 0-100 speed percentage. Returns the step sent.
    pub fn set_fan_speed(&self, fan: FanId, percent: u8) -> Result<VoltageStep> {
        let step = voltage_for_percent(percent);
        log::debug!("{fan}: {percent}% -> {step}");
        self.device.set_fan_voltage(fan, step)?;
        Ok(step)
    }

    /// Set a fan to the supported voltage closest to `volts`.
    pub fn set_fan_voltage(&self, fan: FanId, volts: f64) -> Result<VoltageStep> {
        let step = VoltageStep::nearest(volts);
        log::debug!("{fan}: {volts}V -> {step}");
        self.device.set_fan_voltage(fan, step)?;
        Ok(step)
    }

    /// Send a speed for every fan, stopping at the first failure.
    pub fn apply_speeds(&self, percents: &[u8; FAN_COUNT]) -> Result<()> {
        for fan in FanId::ALL {
            self.set_fan_speed(fan, percents[fan.index()])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridError;
    use crate::polling::tests::FakeSensors;
    use crate::polling::{ControlMode, PollingEngine, PollingEvent, PollingSettings};
    use crate::serial::mock::MockGrid;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    fn dispatcher(grid: &MockGrid) -> CommandDispatcher {
        CommandDispatcher::new(GridDevice::new(Arc::new(grid.channel())))
    }

    #[test]
    fn test_set_fan_speed() {
        let grid = MockGrid::new();
        let step = dispatcher(&grid)
            .set_fan_speed(FanId::new(4).unwrap(), 70)
            .unwrap();
        assert_eq!(step.volts(), 8.5);
        assert_eq!(grid.writes(), vec![vec![0x44, 0x04, 0xC0, 0x00, 0x00, 0x08, 0x50]]);
    }

    #[test]
    fn test_speed_below_threshold_turns_fan_off() {
        let grid = MockGrid::new();
        let step = dispatcher(&grid)
            .set_fan_speed(FanId::new(1).unwrap(), 20)
            .unwrap();
        assert_eq!(step, VoltageStep::OFF);
        assert_eq!(grid.writes()[0][5..], [0x00, 0x00]);
    }

    #[test]
    fn test_set_fan_voltage_snaps_to_step() {
        let grid = MockGrid::new();
        let step = dispatcher(&grid)
            .set_fan_voltage(FanId::new(2).unwrap(), 7.4)
            .unwrap();
        assert_eq!(step.volts(), 7.5);
        assert_eq!(grid.writes()[0], vec![0x44, 0x02, 0xC0, 0x00, 0x00, 0x07, 0x50]);
    }

    #[test]
    fn test_apply_speeds_covers_every_fan() {
        let grid = MockGrid::new();
        dispatcher(&grid).apply_speeds(&[35, 40, 50, 60, 80, 100]).unwrap();
        let writes = grid.writes();
        assert_eq!(writes.len(), 6);
        for (i, frame) in writes.iter().enumerate() {
            assert_eq!(frame[0], 0x44);
            assert_eq!(frame[1], i as u8 + 1);
        }
        assert_eq!(writes[5][5..], [0x0C, 0x00]);
    }

    #[test]
    fn test_closed_channel_is_an_error() {
        let grid = MockGrid::new();
        let d = dispatcher(&grid);
        d.device().channel().close();
        assert!(matches!(
            d.set_fan_speed(FanId::new(1).unwrap(), 50),
            Err(GridError::PortClosed)
        ));
    }

    #[test]
    fn test_concurrent_commands_never_interleave() {
        let grid = MockGrid::new();
        let d = dispatcher(&grid);

        let reader = {
            let device = d.device().clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    device.read_fan_rpm().unwrap();
                }
            })
        };
        for pct in [40, 60, 80, 100] {
            d.set_fan_speed(FanId::new(3).unwrap(), pct).unwrap();
        }
        reader.join().unwrap();

        let writes = grid.writes();
        assert_eq!(writes.len(), 3 * 6 + 4);
        assert_frames_contiguous(&writes);
    }

    #[test]
    fn test_commands_during_automatic_polling_never_interleave() {
        let grid = MockGrid::new();
        let d = dispatcher(&grid);
        let (tx, rx) = mpsc::channel();
        let settings = PollingSettings {
            mode: ControlMode::Automatic,
            cpu_sensors: vec!["cpu/0".to_string()],
            ..PollingSettings::default()
        };
        let mut engine = PollingEngine::new(
            d.device().clone(),
            FakeSensors::new(&[("cpu/0", 65.0)]),
            settings,
            Arc::new(tx),
        );

        engine.start(Duration::from_millis(1)).unwrap();
        for pct in [40, 55, 70, 85, 100, 35, 60, 90] {
            for fan in FanId::ALL {
                d.set_fan_speed(fan, pct).unwrap();
            }
        }
        let mut snapshots = 0;
        while snapshots < 2 {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                PollingEvent::Snapshot(_) => snapshots += 1,
                PollingEvent::Error(e) => panic!("polling failed: {}", e.message),
            }
        }
        engine.stop();

        let writes = grid.writes();
        assert!(writes.iter().any(|w| w[0] == 0x84));
        assert_frames_contiguous(&writes);
    }

    /// Every recorded write is one complete frame, and every RPM or voltage
    /// batch is six consecutive reads with nothing in between.
    fn assert_frames_contiguous(writes: &[Vec<u8>]) {
        let mut i = 0;
        while i < writes.len() {
            match writes[i][0] {
                0x44 => {
                    assert_eq!(writes[i].len(), 7);
                    assert_eq!(writes[i][2..5], [0xC0, 0x00, 0x00]);
                    i += 1;
                }
                op @ (0x8A | 0x84) => {
                    for fan in 1..=6u8 {
                        assert_eq!(writes.get(i), Some(&vec![op, fan]), "frame {i}");
                        i += 1;
                    }
                }
                other => panic!("unexpected opcode {other:#04x}"),
            }
        }
    }
}
