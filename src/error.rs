// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error type shared by the serial, protocol and polling layers.
//!
//! "No data" from a batch read is not an error: it is reported as `None`
//! by the device operations. Everything here is either fatal to the
//! session (port, handshake) or terminal for the polling loop.

use std::io;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(thiserror::Error, Debug)]
pub enum GridError {
    /// The port could not be claimed, e.g. held by another process.
    #[error("Serial port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("No serial port configured")]
    PortNotConfigured,

    #[error("Serial port is not open")]
    PortClosed,

    /// The device did not answer the handshake with `0x21`.
    #[error("Grid on {port} failed to initialize: {}", describe_init_response(*.response))]
    InitFailed { port: String, response: Option<u8> },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid fan id {0}, expected 1-6")]
    InvalidFan(u8),

    #[error("Sensor source error: {0}")]
    Sensor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Polling engine is already running")]
    AlreadyRunning,

    #[error("Manual fan speed rejected while automatic mode is active")]
    AutomaticModeActive,

    #[error("Polling thread failure: {0}")]
    Thread(String),
}

fn describe_init_response(response: Option<u8>) -> String {
    match response {
        Some(byte) => format!("response 0x21 expected, got {byte:#04x}"),
        None => "response 0x21 expected, no response received".to_string(),
    }
}

impl GridError {
    /// Whether this error ends the session (port or handshake failure).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            GridError::PortUnavailable { .. }
                | GridError::PortNotConfigured
                | GridError::InitFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_failed_message_with_byte() {
        let err = GridError::InitFailed {
            port: "/dev/ttyUSB0".to_string(),
            response: Some(0x42),
        };
        assert_eq!(
            err.to_string(),
            "Grid on /dev/ttyUSB0 failed to initialize: response 0x21 expected, got 0x42"
        );
    }

    #[test]
    fn test_init_failed_message_without_response() {
        let err = GridError::InitFailed {
            port: "COM3".to_string(),
            response: None,
        };
        assert!(err.to_string().ends_with("no response received"));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_io_error_is_not_session_fatal() {
        let err = GridError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_session_fatal());
    }
}
