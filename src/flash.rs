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

//! Banked flash driver
//!
//! The chip is reached through an 8 KiB window whose page is picked by the
//! control register. Erase and program are JEDEC-style command sequences
//! followed by DQ6 toggle polling.

/// Size of the banked space (19 address bits)
pub const BANK_SIZE: u32 = 0x80000;

/// Size of the memory-mapped window
pub const WINDOW_SIZE: u32 = 0x2000;

pub const SECTOR_SIZE: u32 = 0x1000;

/// Sectors covering the whole banked space
pub const SECTOR_COUNT: u32 = BANK_SIZE / SECTOR_SIZE;

/// Toggle bit; flips on every read while an operation is running
const DQ6: u8 = 0x40;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Completion poll gave up: the device never settled
    HardwareFault { address: u32 },
    OutOfRange { address: u32 },
}

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashError::HardwareFault { address } => {
                write!(f, "flash did not complete operation at 0x{:05X}", address)
            }
            FlashError::OutOfRange { address } => {
                write!(f, "address 0x{:05X} is outside the banked space", address)
            }
        }
    }
}

impl std::error::Error for FlashError {}

// ============================================================================
// Banked Addressing
// ============================================================================

/// A flat 19-bit address split into page number and window offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankedAddress {
    pub page: u8,
    pub offset: u16,
}

impl BankedAddress {
    pub fn new(address: u32) -> Result<Self, FlashError> {
        if address >= BANK_SIZE {
            return Err(FlashError::OutOfRange { address });
        }
        Ok(BankedAddress {
            page: (address >> 13) as u8,
            offset: (address & (WINDOW_SIZE - 1)) as u16,
        })
    }
}

/// The hardware behind the window: the page-select field of the control
/// register and the 8 KiB data window itself
pub trait BankedBus {
    fn select_page(&mut self, page: u8);

    fn read(&mut self, offset: u16) -> u8;

    fn write(&mut self, offset: u16, value: u8);
}

// ============================================================================
// Command Sequences
// ============================================================================

/// One bus cycle of a command sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub address: u32,
    pub data: u8,
}

const fn cycle(address: u32, data: u8) -> Cycle {
    Cycle { address, data }
}

/// Unlock cycles that precede a final command written at the target
#[derive(Debug, Clone, Copy)]
pub struct CommandSequence {
    pub unlock: &'static [Cycle],
    /// Data of the final cycle; `None` writes the caller's value
    pub command: Option<u8>,
}

/// Three-cycle byte program: the value itself is the final cycle
pub const PROGRAM_SEQUENCE: CommandSequence = CommandSequence {
    unlock: &[cycle(0x5555, 0xAA), cycle(0x2AAA, 0x55), cycle(0x5555, 0xA0)],
    command: None,
};

/// Six-cycle sector erase: the last cycle is 0x30 at the sector base
pub const SECTOR_ERASE_SEQUENCE: CommandSequence = CommandSequence {
    unlock: &[
        cycle(0x5555, 0xAA),
        cycle(0x2AAA, 0x55),
        cycle(0x5555, 0x80),
        cycle(0x5555, 0xAA),
        cycle(0x2AAA, 0x55),
    ],
    command: Some(0x30),
};

impl CommandSequence {
    /// Every cycle in bus order, ending at `target`
    pub fn cycles(&self, target: u32, value: u8) -> impl Iterator<Item = Cycle> + '_ {
        let last = cycle(target, self.command.unwrap_or(value));
        self.unlock.iter().copied().chain(std::iter::once(last))
    }
}

// ============================================================================
// FlashMemory Trait
// ============================================================================

/// What the protocol engine needs from non-volatile storage
pub trait FlashMemory {
    fn erase_all_sectors(&mut self) -> Result<(), FlashError>;

    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), FlashError>;

    /// Select the page holding `address` and copy `buf.len()` bytes out of
    /// the window. The range must not cross a page boundary.
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

// ============================================================================
// Driver
// ============================================================================

pub struct FlashDriver<B: BankedBus> {
    bus: B,
    /// Maximum status reads per operation; `None` polls forever
    poll_limit: Option<u32>,
}

impl<B: BankedBus> FlashDriver<B> {
    pub fn new(bus: B, poll_limit: Option<u32>) -> Self {
        FlashDriver { bus, poll_limit }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn select(&mut self, address: u32) -> Result<BankedAddress, FlashError> {
        let banked = BankedAddress::new(address)?;
        self.bus.select_page(banked.page);
        Ok(banked)
    }

    fn issue(&mut self, sequence: &CommandSequence, target: u32, value: u8) -> Result<(), FlashError> {
        for c in sequence.cycles(target, value) {
            let banked = self.select(c.address)?;
            self.bus.write(banked.offset, c.data);
        }
        Ok(())
    }

    /// Read the target until DQ6 stops toggling between two reads. The
    /// window is still on the target's page from the final command cycle.
    fn wait_complete(&mut self, address: u32) -> Result<(), FlashError> {
        let offset = BankedAddress::new(address)?.offset;
        let mut previous = self.bus.read(offset) & DQ6;
        let mut reads = 1u32;
        loop {
            let current = self.bus.read(offset) & DQ6;
            if current == previous {
                return Ok(());
            }
            previous = current;
            reads += 1;
            if let Some(limit) = self.poll_limit {
                if reads >= limit {
                    return Err(FlashError::HardwareFault { address });
                }
            }
        }
    }

    pub fn erase_sector(&mut self, base: u32) -> Result<(), FlashError> {
        self.issue(&SECTOR_ERASE_SEQUENCE, base, 0)?;
        self.wait_complete(base)
    }
}

impl<B: BankedBus> FlashMemory for FlashDriver<B> {
    /// Erase the whole bank one sector at a time, lowest address first
    fn erase_all_sectors(&mut self) -> Result<(), FlashError> {
        for sector in 0..SECTOR_COUNT {
            self.erase_sector(sector * SECTOR_SIZE)?;
        }
        Ok(())
    }

    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), FlashError> {
        self.issue(&PROGRAM_SEQUENCE, address, value)?;
        self.wait_complete(address)
    }

    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let banked = self.select(address)?;
        let end = banked.offset as usize + buf.len();
        if end > WINDOW_SIZE as usize {
            return Err(FlashError::OutOfRange { address: address + buf.len() as u32 });
        }
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.bus.read(banked.offset + i as u16);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedFlash;

    /// Logs every bus operation as (page, offset, value); reads return a
    /// constant so polls complete immediately
    #[derive(Default)]
    struct TraceBus {
        page: u8,
        writes: Vec<(u8, u16, u8)>,
        reads: usize,
    }

    impl BankedBus for TraceBus {
        fn select_page(&mut self, page: u8) {
            self.page = page;
        }

        fn read(&mut self, _offset: u16) -> u8 {
            self.reads += 1;
            0xFF
        }

        fn write(&mut self, offset: u16, value: u8) {
            self.writes.push((self.page, offset, value));
        }
    }

    #[test]
    fn test_banked_address_split() {
        assert_eq!(BankedAddress::new(0).unwrap(), BankedAddress { page: 0, offset: 0 });
        assert_eq!(BankedAddress::new(0x5555).unwrap(), BankedAddress { page: 2, offset: 0x1555 });
        assert_eq!(BankedAddress::new(0x2AAA).unwrap(), BankedAddress { page: 1, offset: 0x0AAA });
        assert_eq!(BankedAddress::new(0x7FFFF).unwrap(), BankedAddress { page: 63, offset: 0x1FFF });
        assert_eq!(BankedAddress::new(0x80000), Err(FlashError::OutOfRange { address: 0x80000 }));
    }

    #[test]
    fn test_program_sequence_on_the_bus() {
        let mut driver = FlashDriver::new(TraceBus::default(), None);
        driver.program_byte(0x12345, 0x5A).unwrap();
        assert_eq!(driver.bus().writes, vec![
            (2, 0x1555, 0xAA),
            (1, 0x0AAA, 0x55),
            (2, 0x1555, 0xA0),
            (9, 0x0345, 0x5A),
        ]);
        assert_eq!(driver.bus().reads, 2);
    }

    #[test]
    fn test_sector_erase_sequence_on_the_bus() {
        let mut driver = FlashDriver::new(TraceBus::default(), None);
        driver.erase_sector(0x43000).unwrap();
        assert_eq!(driver.bus().writes, vec![
            (2, 0x1555, 0xAA),
            (1, 0x0AAA, 0x55),
            (2, 0x1555, 0x80),
            (2, 0x1555, 0xAA),
            (1, 0x0AAA, 0x55),
            (33, 0x1000, 0x30),
        ]);
    }

    #[test]
    fn test_erase_all_visits_every_sector_in_order() {
        let mut driver = FlashDriver::new(TraceBus::default(), None);
        driver.erase_all_sectors().unwrap();
        let targets: Vec<u32> = driver.bus().writes.iter()
            .filter(|w| w.2 == 0x30)
            .map(|&(page, offset, _)| ((page as u32) << 13) | offset as u32)
            .collect();
        let expected: Vec<u32> = (0..128).map(|s| s * 0x1000).collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_program_then_read_back() {
        let mut driver = FlashDriver::new(SimulatedFlash::new(), Some(1000));
        driver.program_byte(0x10080, 0x12).unwrap();
        driver.program_byte(0x10081, 0x34).unwrap();
        let mut buf = [0u8; 4];
        driver.read_block(0x10080, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0xFF, 0xFF]);
    }

    #[test]
    fn test_poll_waits_for_toggle_to_stop() {
        let mut device = SimulatedFlash::new();
        device.set_busy_reads(7);
        let mut driver = FlashDriver::new(device, None);
        driver.program_byte(0x00010, 0x00).unwrap();
        assert!(!driver.bus().is_busy());
        assert_eq!(driver.bus().image()[0x10], 0x00);
    }

    #[test]
    fn test_stuck_device_reports_hardware_fault() {
        let mut device = SimulatedFlash::new();
        device.set_stuck(true);
        let mut driver = FlashDriver::new(device, Some(64));
        assert_eq!(
            driver.program_byte(0x300, 0x00),
            Err(FlashError::HardwareFault { address: 0x300 })
        );
    }

    #[test]
    fn test_erase_restores_programmed_bytes() {
        let mut driver = FlashDriver::new(SimulatedFlash::new(), Some(1000));
        driver.program_byte(0x7F000, 0x00).unwrap();
        driver.program_byte(0x00FFF, 0x00).unwrap();
        driver.erase_all_sectors().unwrap();
        assert!(driver.bus().image().iter().all(|&b| b == 0xFF));
        assert_eq!(driver.bus().sectors_erased(), 128);
    }

    #[test]
    fn test_read_block_cannot_cross_window() {
        let mut driver = FlashDriver::new(SimulatedFlash::new(), None);
        let mut buf = [0u8; 128];
        assert!(driver.read_block(0x1FC0, &mut buf).is_err());
        assert!(driver.read_block(0x1F80, &mut buf).is_ok());
    }
}
