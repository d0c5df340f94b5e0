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

use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, FlowControl, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte link the LoRa module is reached through
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Returns whatever arrived within `timeout`, or a `TimedOut` error
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    fn is_open(&self) -> bool;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// E22-400T22U USB adapter, or any other serial device
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
    open: bool,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;

        tracing::debug!(port = port_name, baud_rate, "serial port opened");
        Ok(RealSerialPort { port, open: true })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let result = self.port.write_all(buf).and_then(|_| self.port.flush());
        if result.is_err() {
            // A device that stops accepting writes (unplugged adapter) stays dead
            self.open = false;
        }
        result
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        match self.port.read(buf) {
            Err(e) if e.kind() != std::io::ErrorKind::TimedOut => {
                self.open = false;
                Err(e)
            }
            other => other,
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub use mock::{MockLink, MockSerialPort};
