// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::{Read, Write};
use std::time::Duration;
use serialport::SerialPort as SerialPortTrait;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum LinkError {
    /// Nothing will ever arrive again; on the board this is a hang
    Disconnected,
    Io(std::io::Error),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Disconnected => write!(f, "serial link disconnected"),
            LinkError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err)
    }
}

// ============================================================================
// Channel Trait
// ============================================================================

/// How long a poll may spin before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    /// Give up once this many ticks have elapsed
    Ticks(u16),
}

/// Mainline view of the serial link, as used by the protocol engine and
/// the dispatcher
pub trait Channel {
    fn send(&mut self, byte: u8) -> Result<(), LinkError>;

    /// Block until a byte is available and consume it
    fn receive(&mut self) -> Result<u8, LinkError>;

    /// Spin until at least one byte is pending without consuming it.
    /// Returns `false` if `wait` ran out first.
    fn poll(&mut self, wait: Wait) -> Result<bool, LinkError>;

    fn send_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        bytes.iter().try_for_each(|&b| self.send(b))
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Host serial port carrying the emulated board's UART
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }

    pub fn try_clone(&self) -> Result<Self, serialport::Error> {
        Ok(RealSerialPort { port: self.port.try_clone()? })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Channel for Testing
// ============================================================================

#[cfg(test)]
pub struct MockChannel {
    // Bytes the host sends us (None = a poll that times out)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockChannel {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockChannel {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    /// Inbound script with no timeouts
    pub fn bytes(responses: &[u8], expected_writes: Vec<u8>) -> Self {
        Self::new(responses.iter().map(|&b| Some(b)).collect(), expected_writes)
    }
}

#[cfg(test)]
impl Channel for MockChannel {
    fn send(&mut self, byte: u8) -> Result<(), LinkError> {
        self.write_log.push(byte);
        Ok(())
    }

    fn receive(&mut self) -> Result<u8, LinkError> {
        // Out of responses = the host went away
        match self.read_buffer.get(self.read_pos) {
            None => Err(LinkError::Disconnected),
            Some(None) => panic!("blocking receive hit a timeout marker at {}", self.read_pos),
            Some(Some(byte)) => {
                self.read_pos += 1;
                Ok(*byte)
            }
        }
    }

    fn poll(&mut self, wait: Wait) -> Result<bool, LinkError> {
        match self.read_buffer.get(self.read_pos) {
            None => Err(LinkError::Disconnected),
            Some(None) => {
                assert_ne!(wait, Wait::Forever, "Wait::Forever cannot time out");
                self.read_pos += 1;
                Ok(false)
            }
            Some(Some(_)) => Ok(true),
        }
    }
}

#[cfg(test)]
impl Drop for MockChannel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockChannel dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockChannel write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
