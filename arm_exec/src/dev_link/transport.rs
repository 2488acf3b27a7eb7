//! Byte transports underneath the device link

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::io;
use std::time::Duration;

#[cfg(feature = "serial")]
use comms_if::eqpt::arm::LINE_TERMINATOR;
#[cfg(feature = "serial")]
use log::debug;
#[cfg(feature = "serial")]
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
#[cfg(feature = "serial")]
use std::io::{Read, Write};

use super::LinkParams;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A line-oriented, bidirectional byte transport.
pub trait Transport: Send {
    /// Open the transport with the given parameters.
    fn open(&mut self, params: &LinkParams) -> io::Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write one line, the terminator is appended by the transport.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read one line, waiting at most `timeout`. The returned line has its
    /// terminator and surrounding whitespace removed.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Discard any input received but not read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Transport over a serial port, 8 data bits, no parity, one stop bit.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,

    /// Bytes received but not yet returned as a line
    pending: Vec<u8>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
impl SerialTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            pending: Vec::new(),
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }

    /// Pop the next complete, non-empty line from the pending bytes.
    fn take_line(&mut self) -> Option<String> {
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();

            if !line.is_empty() {
                return Some(line);
            }
        }

        None
    }
}

#[cfg(feature = "serial")]
impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn open(&mut self, params: &LinkParams) -> io::Result<()> {
        let port = serialport::new(&params.port, params.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(params.poll_period())
            .open()?;

        debug!("Opened serial port {}", params.port);

        self.port = Some(port);
        self.pending.clear();

        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(line.as_bytes())?;
        port.write_all(LINE_TERMINATOR.as_bytes())?;
        port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut buf = [0u8; 128];
        let read = {
            let port = self.port()?;
            port.set_timeout(timeout)?;
            match port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(e),
            }
        };

        self.pending.extend_from_slice(&buf[..read]);

        Ok(self.take_line())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port()?.clear(ClearBuffer::Input)?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
