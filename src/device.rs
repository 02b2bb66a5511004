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

//! Simulated 512 KiB parallel flash behind the banked window
//!
//! Decodes the JEDEC unlock sequences on address bits A14-A0, programs with
//! AND semantics, erases 4 KiB sectors, and toggles DQ6 while busy.

use std::path::Path;
use crate::board::ControlRegister;
use crate::flash::{BankedBus, BANK_SIZE, SECTOR_SIZE};

const DQ6: u8 = 0x40;
const COMMAND_MASK: u32 = 0x7FFF;

/// Status reads an operation stays busy for unless told otherwise
const DEFAULT_BUSY_READS: u32 = 4;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum DeviceError {
    ImageTooLarge { len: usize },
    Io(std::io::Error),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::ImageTooLarge { len } => {
                write!(f, "image is {} bytes, flash holds {}", len, BANK_SIZE)
            }
            DeviceError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err)
    }
}

// ============================================================================
// Command Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Idle,
    Unlocked1,
    Unlocked2,
    ProgramArmed,
    EraseSetup,
    EraseUnlocked1,
    EraseUnlocked2,
}

#[derive(Debug)]
struct Busy {
    remaining: u32,
    toggle: u8,
}

pub struct SimulatedFlash {
    cells: Vec<u8>,
    control: ControlRegister,
    command: Command,
    busy: Option<Busy>,
    busy_reads: u32,
    stuck: bool,
    sectors_erased: usize,
    bytes_programmed: usize,
}

impl SimulatedFlash {
    /// A fully erased chip
    pub fn new() -> Self {
        SimulatedFlash {
            cells: vec![0xFF; BANK_SIZE as usize],
            control: ControlRegister::BOOT_DEFAULT,
            command: Command::Idle,
            busy: None,
            busy_reads: DEFAULT_BUSY_READS,
            stuck: false,
            sectors_erased: 0,
            bytes_programmed: 0,
        }
    }

    /// Chip contents from an image; short images are padded with 0xFF
    pub fn from_image(image: &[u8]) -> Result<Self, DeviceError> {
        if image.len() > BANK_SIZE as usize {
            return Err(DeviceError::ImageTooLarge { len: image.len() });
        }
        let mut flash = Self::new();
        flash.cells[..image.len()].copy_from_slice(image);
        Ok(flash)
    }

    /// Load `path`, or start erased if it does not exist yet
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        match std::fs::read(path) {
            Ok(image) => Self::from_image(&image),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(DeviceError::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), DeviceError> {
        std::fs::write(path, &self.cells)?;
        Ok(())
    }

    pub fn image(&self) -> &[u8] {
        &self.cells
    }

    #[cfg(test)]
    pub fn set_busy_reads(&mut self, reads: u32) {
        self.busy_reads = reads;
    }

    /// A stuck chip never finishes an operation
    #[cfg(test)]
    pub fn set_stuck(&mut self, stuck: bool) {
        self.stuck = stuck;
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    pub fn sectors_erased(&self) -> usize {
        self.sectors_erased
    }

    pub fn bytes_programmed(&self) -> usize {
        self.bytes_programmed
    }

    fn physical(&self, offset: u16) -> usize {
        ((self.control.page() as usize) << 13) | (offset as usize & 0x1FFF)
    }

    fn start_busy(&mut self) {
        if self.busy_reads > 0 || self.stuck {
            self.busy = Some(Busy { remaining: self.busy_reads.max(1), toggle: 0 });
        }
    }

    fn decode(&mut self, address: usize, value: u8) {
        let cmd = address as u32 & COMMAND_MASK;
        self.command = match (self.command, cmd, value) {
            (Command::Idle, 0x5555, 0xAA) => Command::Unlocked1,
            (Command::Unlocked1, 0x2AAA, 0x55) => Command::Unlocked2,
            (Command::Unlocked2, 0x5555, 0xA0) => Command::ProgramArmed,
            (Command::Unlocked2, 0x5555, 0x80) => Command::EraseSetup,
            (Command::ProgramArmed, _, _) => {
                self.cells[address] &= value;
                self.bytes_programmed += 1;
                self.start_busy();
                Command::Idle
            }
            (Command::EraseSetup, 0x5555, 0xAA) => Command::EraseUnlocked1,
            (Command::EraseUnlocked1, 0x2AAA, 0x55) => Command::EraseUnlocked2,
            (Command::EraseUnlocked2, _, 0x30) => {
                let base = address & !(SECTOR_SIZE as usize - 1);
                self.cells[base..base + SECTOR_SIZE as usize].fill(0xFF);
                self.sectors_erased += 1;
                self.start_busy();
                Command::Idle
            }
            // Anything unexpected resets the decoder
            _ => Command::Idle,
        };
    }
}

impl Default for SimulatedFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl BankedBus for SimulatedFlash {
    fn select_page(&mut self, page: u8) {
        self.control.set_page(page);
    }

    fn read(&mut self, offset: u16) -> u8 {
        let address = self.physical(offset);
        let stuck = self.stuck;
        if let Some(busy) = self.busy.as_mut() {
            busy.toggle ^= DQ6;
            let status = busy.toggle;
            if !stuck {
                busy.remaining -= 1;
                if busy.remaining == 0 {
                    self.busy = None;
                }
            }
            return status;
        }
        self.cells[address]
    }

    fn write(&mut self, offset: u16, value: u8) {
        if self.busy.is_some() {
            return;
        }
        let address = self.physical(offset);
        self.decode(address, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_at(flash: &mut SimulatedFlash, address: u32, value: u8) {
        flash.select_page((address >> 13) as u8);
        flash.write((address & 0x1FFF) as u16, value);
    }

    fn read_at(flash: &mut SimulatedFlash, address: u32) -> u8 {
        flash.select_page((address >> 13) as u8);
        flash.read((address & 0x1FFF) as u16)
    }

    fn drain_busy(flash: &mut SimulatedFlash) {
        while flash.is_busy() {
            flash.read(0);
        }
    }

    #[test]
    fn test_plain_writes_do_not_change_cells() {
        let mut flash = SimulatedFlash::new();
        write_at(&mut flash, 0x100, 0x00);
        assert_eq!(read_at(&mut flash, 0x100), 0xFF);
        assert_eq!(flash.bytes_programmed(), 0);
    }

    #[test]
    fn test_program_sequence_clears_bits_only() {
        let mut flash = SimulatedFlash::new();
        for (addr, value) in [(0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0), (0x40001, 0xF0)] {
            write_at(&mut flash, addr, value);
        }
        drain_busy(&mut flash);
        for (addr, value) in [(0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0), (0x40001, 0x3C)] {
            write_at(&mut flash, addr, value);
        }
        drain_busy(&mut flash);
        assert_eq!(read_at(&mut flash, 0x40001), 0x30);
        assert_eq!(flash.bytes_programmed(), 2);
    }

    #[test]
    fn test_command_addresses_decode_on_low_bits() {
        let mut flash = SimulatedFlash::new();
        // 0x55555 aliases 0x5555 on A14-A0
        for (addr, value) in [(0x55555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0), (0x20, 0x11)] {
            write_at(&mut flash, addr, value);
        }
        drain_busy(&mut flash);
        assert_eq!(flash.image()[0x20], 0x11);
    }

    #[test]
    fn test_dq6_toggles_while_busy() {
        let mut flash = SimulatedFlash::new();
        flash.set_busy_reads(3);
        for (addr, value) in [(0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0), (0x0, 0x00)] {
            write_at(&mut flash, addr, value);
        }
        let a = read_at(&mut flash, 0) & DQ6;
        let b = read_at(&mut flash, 0) & DQ6;
        let c = read_at(&mut flash, 0) & DQ6;
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(!flash.is_busy());
        assert_eq!(read_at(&mut flash, 0), 0x00);
    }

    #[test]
    fn test_sector_erase_only_touches_one_sector() {
        let mut flash = SimulatedFlash::from_image(&vec![0u8; BANK_SIZE as usize]).unwrap();
        let sequence = [
            (0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0x80),
            (0x5555, 0xAA), (0x2AAA, 0x55), (0x3000, 0x30),
        ];
        for (addr, value) in sequence {
            write_at(&mut flash, addr, value);
        }
        drain_busy(&mut flash);
        assert!(flash.image()[0x3000..0x4000].iter().all(|&b| b == 0xFF));
        assert_eq!(flash.image()[0x2FFF], 0x00);
        assert_eq!(flash.image()[0x4000], 0x00);
        assert_eq!(flash.sectors_erased(), 1);
    }

    #[test]
    fn test_broken_sequence_resets_decoder() {
        let mut flash = SimulatedFlash::new();
        for (addr, value) in [(0x5555, 0xAA), (0x2AAA, 0x54), (0x5555, 0xA0), (0x10, 0x00)] {
            write_at(&mut flash, addr, value);
        }
        assert_eq!(flash.image()[0x10], 0xFF);
    }

    #[test]
    fn test_image_padding_and_limit() {
        let flash = SimulatedFlash::from_image(&[1, 2, 3]).unwrap();
        assert_eq!(&flash.image()[..4], &[1, 2, 3, 0xFF]);
        assert_eq!(flash.image().len(), BANK_SIZE as usize);
        assert!(matches!(
            SimulatedFlash::from_image(&vec![0; BANK_SIZE as usize + 1]),
            Err(DeviceError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn test_open_missing_file_is_erased_and_save_round_trips() {
        let path = std::env::temp_dir().join("evnboot_device_test.bin");
        std::fs::remove_file(&path).ok();

        let mut flash = SimulatedFlash::open(&path).unwrap();
        assert!(flash.image().iter().all(|&b| b == 0xFF));
        for (addr, value) in [(0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0), (0x7FFFF, 0x42)] {
            write_at(&mut flash, addr, value);
        }
        flash.save(&path).unwrap();

        let reopened = SimulatedFlash::open(&path).unwrap();
        assert_eq!(reopened.image()[0x7FFFF], 0x42);

        std::fs::remove_file(&path).ok();
    }
}
