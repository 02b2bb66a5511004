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

//! Single-producer/single-consumer circular byte buffer
//!
//! Indices are free-running `u8` counters. The slot is `index % N`, while the
//! number of outstanding bytes is `write - read` modulo 256. Every index
//! update happens inside a critical section so the interrupt side and the
//! mainline never observe a torn update.

use core::cell::RefCell;
use critical_section::Mutex;

/// Outcome of `RingBuffer::enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The buffer was empty. A write index was claimed for a byte that goes
    /// straight to the hardware; nothing was stored.
    Idle,
    Queued,
    Full,
}

struct Slots<const N: usize> {
    data: [u8; N],
    write: u8,
    read: u8,
}

pub struct RingBuffer<const N: usize> {
    inner: Mutex<RefCell<Slots<N>>>,
}

impl<const N: usize> RingBuffer<N> {
    const MASK: usize = {
        // With u8 indices, 256 outstanding bytes would read as zero
        assert!(N.is_power_of_two() && N <= 128, "capacity must be a power of two up to 128");
        N - 1
    };

    pub const fn new() -> Self {
        RingBuffer {
            inner: Mutex::new(RefCell::new(Slots {
                data: [0; N],
                write: 0,
                read: 0,
            })),
        }
    }

    /// Bytes written but not yet consumed
    pub fn pending(&self) -> usize {
        critical_section::with(|cs| {
            let slots = self.inner.borrow_ref(cs);
            slots.write.wrapping_sub(slots.read) as usize
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Producer side. Stores unconditionally; a full buffer is overwritten.
    pub fn push(&self, byte: u8) {
        critical_section::with(|cs| {
            let mut slots = self.inner.borrow_ref_mut(cs);
            let slot = slots.write as usize & Self::MASK;
            slots.data[slot] = byte;
            slots.write = slots.write.wrapping_add(1);
        })
    }

    /// Consumer side
    pub fn pop(&self) -> Option<u8> {
        critical_section::with(|cs| {
            let mut slots = self.inner.borrow_ref_mut(cs);
            if slots.read == slots.write {
                return None;
            }
            let byte = slots.data[slots.read as usize & Self::MASK];
            slots.read = slots.read.wrapping_add(1);
            Some(byte)
        })
    }

    /// Producer side for a consumer that drains by `advance`. On an empty
    /// buffer the write index is claimed without storing, otherwise the byte
    /// is queued if there is room. The emptiness check and the store are one
    /// critical section.
    pub fn enqueue(&self, byte: u8) -> Enqueue {
        critical_section::with(|cs| {
            let mut slots = self.inner.borrow_ref_mut(cs);
            let outstanding = slots.write.wrapping_sub(slots.read) as usize;
            if outstanding == 0 {
                slots.write = slots.write.wrapping_add(1);
                return Enqueue::Idle;
            }
            if outstanding >= N {
                return Enqueue::Full;
            }
            let slot = slots.write as usize & Self::MASK;
            slots.data[slot] = byte;
            slots.write = slots.write.wrapping_add(1);
            Enqueue::Queued
        })
    }

    /// Consumer side. Retire the oldest byte and peek at the next one.
    pub fn advance(&self) -> Option<u8> {
        critical_section::with(|cs| {
            let mut slots = self.inner.borrow_ref_mut(cs);
            if slots.read == slots.write {
                return None;
            }
            slots.read = slots.read.wrapping_add(1);
            if slots.read == slots.write {
                None
            } else {
                Some(slots.data[slots.read as usize & Self::MASK])
            }
        })
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::<8>::new();
        for b in 1..=5 {
            ring.push(b);
        }
        assert_eq!(ring.pending(), 5);
        for b in 1..=5 {
            assert_eq!(ring.pop(), Some(b));
        }
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_indices_wrap_past_255() {
        let ring = RingBuffer::<128>::new();
        let mut next_out = 0u8;
        for i in 0..100u32 {
            ring.push(i as u8);
        }
        for i in 100..1000u32 {
            ring.push(i as u8);
            assert_eq!(ring.pop(), Some(next_out));
            next_out = next_out.wrapping_add(1);
            assert_eq!(ring.pending(), 100);
        }
        while let Some(b) = ring.pop() {
            assert_eq!(b, next_out);
            next_out = next_out.wrapping_add(1);
        }
        assert_eq!(next_out, 1000u32 as u8);
    }

    #[test]
    fn test_push_overwrites_when_full() {
        let ring = RingBuffer::<4>::new();
        for b in 0..5 {
            ring.push(b);
        }
        // The fifth byte landed in slot 0 and the count runs past capacity
        assert_eq!(ring.pending(), 5);
        assert_eq!(ring.pop(), Some(4));
    }

    #[test]
    fn test_largest_ring_reports_full() {
        let ring = RingBuffer::<128>::new();
        assert_eq!(ring.enqueue(0), Enqueue::Idle);
        for b in 1..128 {
            assert_eq!(ring.enqueue(b), Enqueue::Queued);
        }
        assert_eq!(ring.pending(), 128);
        assert_eq!(ring.enqueue(0xFF), Enqueue::Full);
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_enqueue_and_advance() {
        let ring = RingBuffer::<8>::new();
        assert_eq!(ring.enqueue(b'a'), Enqueue::Idle);
        assert_eq!(ring.enqueue(b'b'), Enqueue::Queued);
        assert_eq!(ring.enqueue(b'c'), Enqueue::Queued);
        assert_eq!(ring.pending(), 3);
        assert_eq!(ring.advance(), Some(b'b'));
        assert_eq!(ring.advance(), Some(b'c'));
        assert_eq!(ring.advance(), None);
        assert!(ring.is_empty());
        assert_eq!(ring.advance(), None);
    }

    #[test]
    fn test_enqueue_after_last_byte_retires_claims_again() {
        let ring = RingBuffer::<4>::new();
        assert_eq!(ring.enqueue(0xA1), Enqueue::Idle);
        // The in-flight byte completes before the next enqueue
        assert_eq!(ring.advance(), None);
        assert_eq!(ring.enqueue(0xB2), Enqueue::Idle);
        assert_eq!(ring.pending(), 1);
    }

    #[test]
    fn test_enqueue_full() {
        let ring = RingBuffer::<4>::new();
        assert_eq!(ring.enqueue(0), Enqueue::Idle);
        for b in 1..4 {
            assert_eq!(ring.enqueue(b), Enqueue::Queued);
        }
        assert_eq!(ring.enqueue(4), Enqueue::Full);
        assert_eq!(ring.advance(), Some(1));
        assert_eq!(ring.enqueue(4), Enqueue::Queued);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::<16>::new());
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    while ring.pending() >= 16 {
                        std::thread::yield_now();
                    }
                    ring.push(i as u8);
                }
            })
        };

        let mut expected = 0u32;
        while expected < 2000 {
            match ring.pop() {
                Some(b) => {
                    assert_eq!(b, expected as u8);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
