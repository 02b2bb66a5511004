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

//! Board emulation on a development host
//!
//! The UART and the tick timer become threads: one reads the host serial
//! port and plays the "byte received" interrupt, one writes the data
//! register to the port and plays "transmit complete", and one drives the
//! 100 Hz tick.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use crate::board::{self, Board, ControlRegister};
use crate::serial::RealSerialPort;
use crate::tick::Ticker;
use crate::transport::{SerialLink, SerialTransport, TransmitRegister};

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// UART
// ============================================================================

/// Transmit data register. Loaded bytes are picked up by the transmit thread.
pub struct HostUart {
    line: Sender<u8>,
}

impl HostUart {
    pub fn pair() -> (Self, Receiver<u8>) {
        let (line, wire) = mpsc::channel();
        (HostUart { line }, wire)
    }
}

impl TransmitRegister for HostUart {
    fn load(&self, byte: u8) {
        // A closed line means the transmit thread is gone; the link-lost
        // flag already tells the mainline
        let _ = self.line.send(byte);
    }
}

pub type HostTransport = SerialTransport<HostUart>;

/// Receive interrupt source: move bytes from `source` into the transport
/// until `stop` is raised or the source fails.
fn pump_receive<R: TransmitRegister>(
    mut source: impl FnMut(&mut [u8]) -> std::io::Result<usize>,
    transport: &SerialTransport<R>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Relaxed) {
        match source(&mut buf) {
            Ok(n) => buf[..n].iter().for_each(|&b| transport.on_receive(b)),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                eprintln!("Serial read failed: {}", e);
                transport.on_link_lost();
                return;
            }
        }
    }
}

/// Transmit side: every byte loaded into the data register goes to `sink`,
/// then the transport hears "transmit complete".
fn pump_transmit<R: TransmitRegister>(
    wire: &Receiver<u8>,
    mut sink: impl FnMut(u8) -> std::io::Result<()>,
    transport: &SerialTransport<R>,
    stop: &AtomicBool,
) {
    loop {
        match wire.recv_timeout(PUMP_INTERVAL) {
            Ok(byte) => {
                if let Err(e) = sink(byte) {
                    eprintln!("Serial write failed: {}", e);
                    transport.on_link_lost();
                    return;
                }
                transport.on_transmit_complete();
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

// ============================================================================
// Emulated Board
// ============================================================================

pub struct EmulatedBoard {
    port: RealSerialPort,
    transport: Arc<HostTransport>,
    ticker: Arc<Ticker>,
    wire: Option<Receiver<u8>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    control: ControlRegister,
    debug: bool,
}

impl EmulatedBoard {
    pub fn new(port: RealSerialPort, debug: bool) -> Self {
        let (uart, wire) = HostUart::pair();
        EmulatedBoard {
            port,
            transport: Arc::new(SerialTransport::new(uart)),
            ticker: Arc::new(Ticker::new()),
            wire: Some(wire),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            control: ControlRegister::default(),
            debug,
        }
    }

    /// Mainline handle on the UART, timed by the board's tick counter
    pub fn link(&self) -> SerialLink<HostUart, Arc<Ticker>> {
        SerialLink::new(self.transport.clone(), self.ticker.clone())
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(name.to_string()).spawn(body) {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                eprintln!("Failed to start {}: {}", name, e);
                self.transport.on_link_lost();
            }
        }
    }

    fn start_uart(&mut self) {
        let mut reader = match self.port.try_clone() {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Failed to clone serial port: {}", e);
                self.transport.on_link_lost();
                return;
            }
        };
        let transport = self.transport.clone();
        let stop = self.stop.clone();
        self.spawn("uart-rx", move || {
            pump_receive(|buf| reader.read_timeout(buf, PUMP_INTERVAL), &transport, &stop);
        });

        let mut writer = match self.port.try_clone() {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Failed to clone serial port: {}", e);
                self.transport.on_link_lost();
                return;
            }
        };
        let Some(wire) = self.wire.take() else {
            return;
        };
        let transport = self.transport.clone();
        let stop = self.stop.clone();
        self.spawn("uart-tx", move || {
            pump_transmit(&wire, |byte| writer.write_all(&[byte]), &transport, &stop);
        });
    }

    fn start_timer(&mut self) {
        let ticker = self.ticker.clone();
        let stop = self.stop.clone();
        self.spawn("tick", move || ticker.run(&stop));
    }
}

impl Board for EmulatedBoard {
    fn init(&mut self) {
        // The emulated memory controller is ready as soon as it is probed
        self.control = board::bring_up(|value| value);
        if self.debug {
            println!(
                "Control register: 0x{:02X}, power {}",
                self.control.0,
                if self.control.power_ok() { "ok" } else { "failing" }
            );
        }

        self.start_uart();
        self.start_timer();
    }

    fn quiesce(&mut self) {
        // Let queued replies reach the host before the UART stops
        if let Err(e) = self.transport.flush() {
            if self.debug { println!("Transmit flush abandoned: {}", e); }
        }
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if self.debug {
            println!("UART and timer stopped, {} unread bytes dropped", self.transport.pending_rx());
        }
    }

    fn map_application(&mut self) {
        self.control.set_offboard_memory(true);
        if self.debug {
            println!(
                "Control register: 0x{:02X}, off-board memory {}",
                self.control.0,
                if self.control.offboard_memory() { "mapped" } else { "unmapped" }
            );
        }
    }

    fn jump_to_reset_vector(&mut self) -> ! {
        println!("Jumping to application at 0x0000");
        std::process::exit(0)
    }
}
