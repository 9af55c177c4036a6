// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Exclusive access to the serial connection.
//!
//! A [`SerialChannel`] owns at most one open link. Every operation that
//! touches the link runs inside a single mutex held for the duration of
//! the call, so bytes from two logical operations never interleave.
//! Multi-step exchanges (write, settle, read) go through
//! [`SerialChannel::exchange`], which holds the lock for the whole closure.
//!
//! Read and write timeouts are not errors: they end the transfer early and
//! the caller sees a short read or a short write count.

use crate::error::{GridError, Result};
use serialport::{ClearBuffer, DataBits, Parity, StopBits};
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Line speed expected by the Grid controller.
pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Per-transfer read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Port configuration
// ---------------------------------------------------------------------------

/// Line parameters for opening a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl PortConfig {
    /// 4800 baud, 8N1, 100ms timeouts.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// An open byte link to the device.
pub trait SerialLink: Read + Write + Send {
    /// Discard pending bytes in the given direction(s).
    fn clear_buffers(&mut self, which: ClearBuffer) -> io::Result<()>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn clear_buffers(&mut self, which: ClearBuffer) -> io::Result<()> {
        self.clear(which).map_err(io::Error::from)
    }
}

/// Opens links. Separated from the channel so tests can substitute a
/// scripted device.
pub trait SerialBackend: Send + Sync {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialLink>>;
}

/// Backend for real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialLink>> {
        // serialport has a single timeout for both directions
        let timeout = config.read_timeout.max(config.write_timeout);
        let port = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity)
            .timeout(timeout)
            .open()
            .map_err(|e| GridError::PortUnavailable {
                port: config.port_name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(port))
    }
}

/// List the serial ports present on the system, sorted by name.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct ChannelState {
    config: Option<PortConfig>,
    link: Option<Box<dyn SerialLink>>,
}

/// The single serial connection shared by the polling loop and foreground
/// commands.
pub struct SerialChannel {
    backend: Box<dyn SerialBackend>,
    state: Mutex<ChannelState>,
}

impl SerialChannel {
    pub fn new(backend: Box<dyn SerialBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(ChannelState {
                config: None,
                link: None,
            }),
        }
    }

    /// Channel backed by the operating system's serial ports.
    pub fn system() -> Self {
        Self::new(Box::new(SystemSerial))
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // A panic inside an exchange leaves the link itself intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the line parameters. An open link is closed first; call
    /// [`open`](Self::open) afterwards.
    pub fn configure(&self, config: PortConfig) {
        let mut state = self.lock();
        if state.link.take().is_some() {
            log::info!("Closed serial port before reconfiguring");
        }
        log::debug!(
            "Configured serial port {} ({} baud)",
            config.port_name,
            config.baud_rate
        );
        state.config = Some(config);
    }

    /// Open the configured port. Opening an already-open channel is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut state = self.lock();
        if state.link.is_some() {
            return Ok(());
        }
        let config = state.config.as_ref().ok_or(GridError::PortNotConfigured)?;
        let link = self.backend.open(config)?;
        log::info!("Opened serial port {}", config.port_name);
        state.link = Some(link);
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.lock();
        if state.link.take().is_some() {
            if let Some(config) = &state.config {
                log::info!("Closed serial port {}", config.port_name);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Name of the configured port, open or not.
    pub fn port_name(&self) -> Option<String> {
        self.lock().config.as_ref().map(|c| c.port_name.clone())
    }

    /// Run `f` with exclusive access to the open link. The lock is held
    /// until `f` returns.
    pub fn exchange<T>(&self, f: impl FnOnce(&mut Exchange<'_>) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let link = state.link.as_mut().ok_or(GridError::PortClosed)?;
        let mut exchange = Exchange { link: &mut **link };
        f(&mut exchange)
    }

    /// Write `bytes` as one locked operation; returns the number written.
    pub fn write_exclusive(&self, bytes: &[u8]) -> Result<usize> {
        self.exchange(|ex| ex.write(bytes))
    }

    /// Read up to `max_len` bytes as one locked operation. Fewer bytes are
    /// returned if the read timeout expires.
    pub fn read_exclusive(&self, max_len: usize) -> Result<Vec<u8>> {
        self.exchange(|ex| ex.read(max_len))
    }

    /// Discard pending input and output.
    pub fn flush_buffers(&self) -> Result<()> {
        self.exchange(|ex| ex.clear(ClearBuffer::All))
    }
}

/// Borrowed access to the link inside a locked [`SerialChannel::exchange`].
pub struct Exchange<'a> {
    link: &'a mut (dyn SerialLink + 'static),
}

impl Exchange<'_> {
    /// Write as much of `bytes` as the device accepts before timing out.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match self.link.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match self.link.flush() {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(written)
    }

    /// Read until `max_len` bytes arrive or the read timeout expires.
    pub fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            match self.link.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn clear(&mut self, which: ClearBuffer) -> Result<()> {
        self.link.clear_buffers(which).map_err(GridError::from)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ---------------------------------------------------------------------------
// Scripted device for tests
// ---------------------------------------------------------------------------
