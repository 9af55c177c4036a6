// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Grid+ V2 wire protocol.
//!
//! Every operation is a fixed-length request followed by a fixed-length
//! response. There is no length prefix, no escaping and no checksum; the
//! device needs [`SETTLE_DELAY`] between a request and its response and
//! does not signal readiness.
//!
//! | Operation    | Request                          | Response        |
//! |--------------|----------------------------------|-----------------|
//! | Initialize   | `C0`                             | `21`            |
//! | Set voltage  | `44 <fan> C0 00 00 <int> <frac>` | 1 byte, ignored |
//! | Read RPM     | `8A <fan>`                       | `C0 00 00 hi lo`|
//! | Read voltage | `84 <fan>`                       | `C0 00 00 v f`  |
//!
//! The encode/decode functions are pure. [`GridDevice`] runs them over a
//! [`SerialChannel`], one lock acquisition per operation.

use crate::curve::VoltageStep;
use crate::error::{GridError, Result};
use crate::serial::SerialChannel;
use serde::{Deserialize, Serialize};
use serialport::ClearBuffer;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Time the device needs between a request and its response.
pub const SETTLE_DELAY: Duration = Duration::from_millis(40);

/// Number of fan channels on the controller.
pub const FAN_COUNT: usize = 6;

const OP_INITIALIZE: u8 = 0xC0;
const INIT_ACK: u8 = 0x21;
const OP_SET_VOLTAGE: u8 = 0x44;
const OP_READ_RPM: u8 = 0x8A;
const OP_READ_VOLTAGE: u8 = 0x84;

/// Every RPM/voltage response starts with these bytes.
const RESPONSE_HEADER: [u8; 3] = [0xC0, 0x00, 0x00];
const RESPONSE_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A fan channel, 1 through 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FanId(u8);

impl FanId {
    pub const ALL: [FanId; FAN_COUNT] = [FanId(1), FanId(2), FanId(3), FanId(4), FanId(5), FanId(6)];

    pub fn new(id: u8) -> Result<Self> {
        if (1..=FAN_COUNT as u8).contains(&id) {
            Ok(Self(id))
        } else {
            Err(GridError::InvalidFan(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based position, for indexing per-fan arrays.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for FanId {
    type Error = GridError;

    fn try_from(id: u8) -> Result<Self> {
        Self::new(id)
    }
}

impl From<FanId> for u8 {
    fn from(fan: FanId) -> u8 {
        fan.0
    }
}

impl fmt::Display for FanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fan {}", self.0)
    }
}

/// A voltage as reported by the device: one byte of whole volts and one
/// byte of fraction.
///
/// The fraction byte's decimal value is written out as two digits, so
/// `0x0B 0x01` reads as 11.01V.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanVoltage {
    pub whole: u8,
    pub fraction: u8,
}

impl FanVoltage {
    /// The value [`Display`](fmt::Display) prints, as a number: the
    /// fraction's digits (at least two) follow the decimal point.
    pub fn volts(self) -> f64 {
        let scale = if self.fraction >= 100 { 1000.0 } else { 100.0 };
        f64::from(self.whole) + f64::from(self.fraction) / scale
    }

    pub fn is_zero(self) -> bool {
        self.whole == 0 && self.fraction == 0
    }
}

impl fmt::Display for FanVoltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}V", self.whole, self.fraction)
    }
}

/// Result of a six-fan batch read: all six values, or `None` when any
/// single response was missing or malformed.
pub type FanBatch<T> = Option<[T; FAN_COUNT]>;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_initialize() -> [u8; 1] {
    [OP_INITIALIZE]
}

pub fn encode_set_voltage(fan: FanId, step: VoltageStep) -> [u8; 7] {
    let [int_part, frac_part] = step.wire_bytes();
    [OP_SET_VOLTAGE, fan.get(), 0xC0, 0x00, 0x00, int_part, frac_part]
}

pub fn encode_read_rpm(fan: FanId) -> [u8; 2] {
    [OP_READ_RPM, fan.get()]
}

pub fn encode_read_voltage(fan: FanId) -> [u8; 2] {
    [OP_READ_VOLTAGE, fan.get()]
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Check the handshake reply. Returns the offending byte (or `None` for
/// silence) on failure.
pub fn decode_initialize(response: &[u8]) -> std::result::Result<(), Option<u8>> {
    match response.first() {
        Some(&INIT_ACK) => Ok(()),
        other => Err(other.copied()),
    }
}

fn checked_payload(response: &[u8]) -> Option<(u8, u8)> {
    match response {
        [h0, h1, h2, hi, lo] if [*h0, *h1, *h2] == RESPONSE_HEADER => Some((*hi, *lo)),
        _ => None,
    }
}

/// RPM from a read-RPM response, big-endian in the last two bytes.
pub fn decode_rpm(response: &[u8]) -> Option<u16> {
    checked_payload(response).map(|(hi, lo)| u16::from(hi) * 256 + u16::from(lo))
}

pub fn decode_voltage(response: &[u8]) -> Option<FanVoltage> {
    checked_payload(response).map(|(whole, fraction)| FanVoltage { whole, fraction })
}

// ---------------------------------------------------------------------------
// Device operations
// ---------------------------------------------------------------------------

/// The Grid on the other end of a [`SerialChannel`]. Cheap to clone; all
/// clones share the channel and its lock.
#[derive(Clone)]
pub struct GridDevice {
    channel: Arc<SerialChannel>,
}

impl GridDevice {
    pub fn new(channel: Arc<SerialChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<SerialChannel> {
        &self.channel
    }

    /// Send the handshake. Anything other than `0x21` fails the session.
    pub fn initialize(&self) -> Result<()> {
        let response = self.channel.exchange(|ex| {
            ex.clear(ClearBuffer::All)?;
            ex.write(&encode_initialize())?;
            thread::sleep(SETTLE_DELAY);
            ex.read(1)
        })?;

        decode_initialize(&response).map_err(|byte| GridError::InitFailed {
            port: self.channel.port_name().unwrap_or_default(),
            response: byte,
        })?;
        log::info!("Grid initialized");
        Ok(())
    }

    /// Set one fan's voltage. The one-byte reply is drained, not checked.
    pub fn set_fan_voltage(&self, fan: FanId, step: VoltageStep) -> Result<()> {
        let frame = encode_set_voltage(fan, step);
        self.channel.exchange(|ex| {
            ex.write(&frame)?;
            thread::sleep(SETTLE_DELAY);
            ex.read(1)
        })?;
        log::debug!("Set {fan} to {step}");
        Ok(())
    }

    /// Read the RPM of all six fans under one lock.
    pub fn read_fan_rpm(&self) -> Result<FanBatch<u16>> {
        let batch = self.read_batch(encode_read_rpm, decode_rpm)?;
        if batch.is_none() {
            log::debug!("No fan RPM data from Grid");
        }
        Ok(batch)
    }

    /// Read the voltage of all six fans under one lock.
    pub fn read_fan_voltage(&self) -> Result<FanBatch<FanVoltage>> {
        let batch = self.read_batch(encode_read_voltage, decode_voltage)?;
        if batch.is_none() {
            log::debug!("No fan voltage data from Grid");
        }
        Ok(batch)
    }

    fn read_batch<T: Copy + Default>(
        &self,
        encode: fn(FanId) -> [u8; 2],
        decode: fn(&[u8]) -> Option<T>,
    ) -> Result<FanBatch<T>> {
        self.channel.exchange(|ex| {
            let mut values = [T::default(); FAN_COUNT];
            for fan in FanId::ALL {
                ex.clear(ClearBuffer::Output)?;
                ex.write(&encode(fan))?;
                thread::sleep(SETTLE_DELAY);
                let response = ex.read(RESPONSE_LEN)?;
                match decode(&response) {
                    Some(value) => values[fan.index()] = value,
                    None => return Ok(None),
                }
            }
            Ok(Some(values))
        })
    }
}
