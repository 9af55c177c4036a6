// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and voltage quantization.
//!
//! A curve maps a temperature to a fan speed percentage (0-100) with three
//! linear segments. The percentage is then snapped to one of the voltages
//! the Grid accepts.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Voltage steps
// ---------------------------------------------------------------------------

/// One of the voltages the Grid accepts: 0.0V (stopped) or one of the 17
/// running voltages 4.0V-12.0V in 0.5V steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct VoltageStep(u8);

impl VoltageStep {
    pub const OFF: VoltageStep = VoltageStep(0);
    pub const MIN_RUNNING: VoltageStep = VoltageStep(1);
    pub const MAX: VoltageStep = VoltageStep(17);

    /// Every accepted step, ascending.
    pub const ALL: [VoltageStep; 18] = [
        VoltageStep(0),
        VoltageStep(1),
        VoltageStep(2),
        VoltageStep(3),
        VoltageStep(4),
        VoltageStep(5),
        VoltageStep(6),
        VoltageStep(7),
        VoltageStep(8),
        VoltageStep(9),
        VoltageStep(10),
        VoltageStep(11),
        VoltageStep(12),
        VoltageStep(13),
        VoltageStep(14),
        VoltageStep(15),
        VoltageStep(16),
        VoltageStep(17),
    ];

    /// Voltage in volts.
    pub fn volts(self) -> f64 {
        match self.0 {
            0 => 0.0,
            n => 3.5 + f64::from(n) * 0.5,
        }
    }

    /// Wire encoding: integer volts, then `0x50` for a half volt or `0x00`.
    ///
    /// 7.5V encodes as `[0x07, 0x50]`, 12.0V as `[0x0C, 0x00]`.
    pub fn wire_bytes(self) -> [u8; 2] {
        if self.0 == 0 {
            return [0x00, 0x00];
        }
        let half_volts = self.0 + 7;
        let frac = if half_volts % 2 == 1 { 0x50 } else { 0x00 };
        [half_volts / 2, frac]
    }

    /// The exact step for `volts`, if it is one the Grid accepts.
    pub fn from_volts(volts: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.volts() == volts)
    }

    /// The closest accepted step. Ties go to the lower step.
    pub fn nearest(volts: f64) -> Self {
        let mut best = Self::OFF;
        for step in Self::ALL {
            if (step.volts() - volts).abs() < (best.volts() - volts).abs() {
                best = step;
            }
        }
        best
    }
}

impl fmt::Display for VoltageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}V", self.volts())
    }
}

impl TryFrom<f64> for VoltageStep {
    type Error = String;

    fn try_from(volts: f64) -> Result<Self, Self::Error> {
        Self::from_volts(volts).ok_or_else(|| format!("{volts}V is not a supported voltage step"))
    }
}

impl From<VoltageStep> for f64 {
    fn from(step: VoltageStep) -> f64 {
        step.volts()
    }
}

/// Lower bound (inclusive) of the percentage bucket for each running step,
/// 4.0V through 12.0V.
const STEP_THRESHOLDS: [u8; 17] = [
    33, 36, 40, 44, 48, 52, 56, 60, 64, 68, 72, 76, 80, 84, 88, 93, 98,
];

/// Convert a fan speed percentage to the voltage step the Grid should run.
///
/// Below 33% the fan is stopped. Buckets are half-open `[low, high)`;
/// 98% and above (including anything past 100) is 12.0V.
pub fn voltage_for_percent(pct: u8) -> VoltageStep {
    let running = STEP_THRESHOLDS.iter().filter(|&&low| pct >= low).count();
    VoltageStep(running as u8)
}

// ---------------------------------------------------------------------------
// Fan curves
// ---------------------------------------------------------------------------

/// The six parameters of a three-segment fan curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FanCurveConfig {
    /// Speed held at or below `start_increase_temp_c`.
    pub min_speed_pct: u8,
    pub start_increase_temp_c: f64,
    pub intermediate_speed_pct: u8,
    pub intermediate_temp_c: f64,
    /// Speed held at or above `max_temp_c`.
    pub max_speed_pct: u8,
    pub max_temp_c: f64,
}

impl Default for FanCurveConfig {
    fn default() -> Self {
        Self {
            min_speed_pct: 35,
            start_increase_temp_c: 40.0,
            intermediate_speed_pct: 60,
            intermediate_temp_c: 60.0,
            max_speed_pct: 100,
            max_temp_c: 75.0,
        }
    }
}

impl FanCurveConfig {
    /// Target speed for `temp_c`, rounded to a whole percent.
    ///
    /// - At or below the start temperature: `min_speed_pct`
    /// - Up to the intermediate temperature: first segment
    /// - Up to the max temperature: second segment
    /// - Above: `max_speed_pct`
    ///
    /// A segment whose two temperatures coincide yields the higher of its
    /// two speeds instead of dividing by zero.
    pub fn percent_for_temperature(&self, temp_c: f64) -> u8 {
        let speed = if temp_c <= self.start_increase_temp_c {
            f64::from(self.min_speed_pct)
        } else if temp_c <= self.intermediate_temp_c {
            interpolate(
                (self.start_increase_temp_c, self.min_speed_pct),
                (self.intermediate_temp_c, self.intermediate_speed_pct),
                temp_c,
            )
        } else if temp_c <= self.max_temp_c {
            interpolate(
                (self.intermediate_temp_c, self.intermediate_speed_pct),
                (self.max_temp_c, self.max_speed_pct),
                temp_c,
            )
        } else {
            f64::from(self.max_speed_pct)
        };
        speed.round().clamp(0.0, 100.0) as u8
    }

    /// Check the ordering the curve assumes: speeds and temperatures
    /// strictly increasing, speeds within 0-100.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_speed_pct > 100 {
            return Err(format!(
                "Maximum speed {}% exceeds 100%",
                self.max_speed_pct
            ));
        }
        if !(self.min_speed_pct < self.intermediate_speed_pct
            && self.intermediate_speed_pct < self.max_speed_pct)
        {
            return Err(format!(
                "Speeds must be strictly increasing (min {}%, intermediate {}%, max {}%)",
                self.min_speed_pct, self.intermediate_speed_pct, self.max_speed_pct
            ));
        }
        let temps = [
            self.start_increase_temp_c,
            self.intermediate_temp_c,
            self.max_temp_c,
        ];
        if temps.iter().any(|t| !t.is_finite()) {
            return Err("Curve temperatures must be finite".to_string());
        }
        if !(temps[0] < temps[1] && temps[1] < temps[2]) {
            return Err(format!(
                "Temperatures must be strictly increasing (start {}C, intermediate {}C, max {}C)",
                temps[0], temps[1], temps[2]
            ));
        }
        Ok(())
    }
}

fn interpolate((x1, y1): (f64, u8), (x2, y2): (f64, u8), x: f64) -> f64 {
    let (y1, y2) = (f64::from(y1), f64::from(y2));
    let range_t = x2 - x1;
    if range_t == 0.0 {
        return y1.max(y2);
    }
    let k = (y2 - y1) / range_t;
    y1 + k * (x - x1)
}
