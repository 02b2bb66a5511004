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

//! Interrupt-driven serial transport
//!
//! `SerialTransport` is shared between the UART interrupt handlers
//! (`on_receive`, `on_transmit_complete`) and the mainline (`send`,
//! `receive`). The receive ring is filled only by the interrupt side and
//! drained only by the mainline; the transmit ring is the converse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::ring::{Enqueue, RingBuffer};
use crate::serial::{Channel, LinkError, Wait};
use crate::tick::TickSource;

pub const RX_BUFFER_SIZE: usize = 128;
pub const TX_BUFFER_SIZE: usize = 128;

/// The UART transmit data register. Loading it starts a transmission; the
/// hardware reports completion through `SerialTransport::on_transmit_complete`.
pub trait TransmitRegister: Send + Sync {
    fn load(&self, byte: u8);
}

pub struct SerialTransport<R: TransmitRegister> {
    rx: RingBuffer<RX_BUFFER_SIZE>,
    tx: RingBuffer<TX_BUFFER_SIZE>,
    register: R,
    connected: AtomicBool,
}

impl<R: TransmitRegister> SerialTransport<R> {
    pub fn new(register: R) -> Self {
        SerialTransport {
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            register,
            connected: AtomicBool::new(true),
        }
    }

    // ------------------------------------------------------------------------
    // Interrupt side
    // ------------------------------------------------------------------------

    /// "Byte received" interrupt. Overruns overwrite the oldest data.
    pub fn on_receive(&self, byte: u8) {
        self.rx.push(byte);
    }

    /// "Transmit complete" interrupt. Retires the byte that just went out and
    /// starts the next queued one, if any.
    pub fn on_transmit_complete(&self) {
        critical_section::with(|_| {
            if let Some(next) = self.tx.advance() {
                self.register.load(next);
            }
        })
    }

    /// The physical link is gone. Any mainline spin returns `Disconnected`.
    pub fn on_link_lost(&self) {
        self.connected.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Mainline side
    // ------------------------------------------------------------------------

    pub fn pending_rx(&self) -> usize {
        self.rx.pending()
    }

    pub fn pending_tx(&self) -> usize {
        self.tx.pending()
    }

    fn check_link(&self) -> Result<(), LinkError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkError::Disconnected)
        }
    }

    /// Queue a byte, or load it straight into the data register when the
    /// transmitter is idle. Only a full ring spins, and each retry makes the
    /// idle-or-queue decision afresh.
    pub fn send(&self, byte: u8) -> Result<(), LinkError> {
        loop {
            let outcome = critical_section::with(|_| {
                let outcome = self.tx.enqueue(byte);
                if outcome == Enqueue::Idle {
                    self.register.load(byte);
                }
                outcome
            });
            if outcome != Enqueue::Full {
                return Ok(());
            }
            self.check_link()?;
            std::thread::yield_now();
        }
    }

    pub fn receive(&self) -> Result<u8, LinkError> {
        loop {
            if let Some(byte) = self.rx.pop() {
                return Ok(byte);
            }
            self.check_link()?;
            std::thread::yield_now();
        }
    }

    pub fn poll<T: TickSource>(&self, wait: Wait, clock: &T) -> Result<bool, LinkError> {
        let start = clock.now();
        loop {
            if !self.rx.is_empty() {
                return Ok(true);
            }
            self.check_link()?;
            if let Wait::Ticks(limit) = wait {
                if clock.since(start) >= limit {
                    return Ok(false);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Spin until everything queued has left the UART
    pub fn flush(&self) -> Result<(), LinkError> {
        while self.pending_tx() > 0 {
            self.check_link()?;
            std::thread::yield_now();
        }
        Ok(())
    }
}

// ============================================================================
// SerialLink
// ============================================================================

/// Mainline handle on a shared transport plus the tick source used for
/// timed polls
pub struct SerialLink<R: TransmitRegister, T: TickSource> {
    transport: Arc<SerialTransport<R>>,
    clock: T,
}

impl<R: TransmitRegister, T: TickSource> SerialLink<R, T> {
    pub fn new(transport: Arc<SerialTransport<R>>, clock: T) -> Self {
        SerialLink { transport, clock }
    }
}

impl<R: TransmitRegister, T: TickSource> Channel for SerialLink<R, T> {
    fn send(&mut self, byte: u8) -> Result<(), LinkError> {
        self.transport.send(byte)
    }

    fn receive(&mut self) -> Result<u8, LinkError> {
        self.transport.receive()
    }

    fn poll(&mut self, wait: Wait) -> Result<bool, LinkError> {
        self.transport.poll(wait, &self.clock)
    }
}

// ============================================================================
// Test Register
// ============================================================================

/// Records every byte loaded into the data register. Completion is up to
/// the test, which plays the hardware.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingRegister {
    pub loaded: std::sync::Mutex<Vec<u8>>,
}

#[cfg(test)]
impl RecordingRegister {
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.loaded.lock().unwrap())
    }
}

#[cfg(test)]
impl TransmitRegister for RecordingRegister {
    fn load(&self, byte: u8) {
        self.loaded.lock().unwrap().push(byte);
    }
}

#[cfg(test)]
impl TransmitRegister for Arc<RecordingRegister> {
    fn load(&self, byte: u8) {
        (**self).load(byte);
    }
}
