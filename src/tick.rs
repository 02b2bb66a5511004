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

//! Coarse 100 Hz tick counter

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::{Duration, Instant};

/// Ticks per second
pub const TICK_HZ: u16 = 100;

/// Timer reload value for a 100 Hz overflow at 11.0592 MHz / 12
pub const TIMER_RELOAD: u16 = 56320;

/// Timer input clock: the 11.0592 MHz crystal divided by 12
const TIMER_CLOCK_HZ: u64 = 11_059_200 / 12;

/// Time from loading `reload` into the 16-bit timer until it overflows
pub fn overflow_period(reload: u16) -> Duration {
    let counts = 0x1_0000 - reload as u64;
    Duration::from_nanos(counts * 1_000_000_000 / TIMER_CLOCK_HZ)
}

// ============================================================================
// TickSource Trait
// ============================================================================

/// Read-only view of the tick counter. Wraps silently at `u16::MAX`.
pub trait TickSource {
    fn now(&self) -> u16;

    /// Ticks elapsed since `start`, robust to counter wrap
    fn since(&self, start: u16) -> u16 {
        self.now().wrapping_sub(start)
    }
}

impl<T: TickSource + ?Sized> TickSource for Arc<T> {
    fn now(&self) -> u16 {
        (**self).now()
    }
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> u16 {
        (**self).now()
    }
}

// ============================================================================
// Ticker
// ============================================================================

/// The counter itself, incremented from the timer interrupt
#[derive(Debug, Default)]
pub struct Ticker {
    count: AtomicU16,
}

impl Ticker {
    pub fn new() -> Self {
        Ticker { count: AtomicU16::new(0) }
    }

    /// Timer overflow handler. Returns the reload value for the timer.
    pub fn on_overflow(&self) -> u16 {
        self.count.fetch_add(1, Ordering::Relaxed);
        TIMER_RELOAD
    }

    /// Drive `on_overflow` until `stop` is raised. Each overflow period comes
    /// from the reload value the handler returns. Deadlines advance from the
    /// previous deadline, not from when the handler ran.
    pub fn run(&self, stop: &AtomicBool) {
        let mut deadline = Instant::now() + overflow_period(TIMER_RELOAD);
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
            let reload = self.on_overflow();
            deadline += overflow_period(reload);
        }
    }
}

impl TickSource for Ticker {
    fn now(&self) -> u16 {
        self.count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Fake Clock for Testing
// ============================================================================

/// Advances by `step` every time it is read, so polling loops make progress
/// without real time passing. `on_tick` runs after each advance.
#[cfg(test)]
pub struct FakeClock {
    now: std::cell::Cell<u16>,
    step: u16,
    on_tick: Option<Box<dyn Fn(u16)>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(step: u16) -> Self {
        FakeClock { now: std::cell::Cell::new(0), step, on_tick: None }
    }

    pub fn starting_at(start: u16, step: u16) -> Self {
        FakeClock { now: std::cell::Cell::new(start), step, on_tick: None }
    }

    pub fn with_hook(step: u16, on_tick: impl Fn(u16) + 'static) -> Self {
        FakeClock { now: std::cell::Cell::new(0), step, on_tick: Some(Box::new(on_tick)) }
    }

    pub fn peek(&self) -> u16 {
        self.now.get()
    }
}

#[cfg(test)]
impl TickSource for FakeClock {
    fn now(&self) -> u16 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step));
        if let Some(hook) = &self.on_tick {
            hook(now);
        }
        now
    }
}
