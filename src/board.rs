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

use crate::flash::{BankedBus, FlashDriver};

// ============================================================================
// Control Register
// ============================================================================

/// The board's control register:
///
/// | bits | field                                                     |
/// |------|-----------------------------------------------------------|
/// | 0-5  | page of the 8 KiB window                                  |
/// | 6    | off-board code memory enable                              |
/// | 7    | read: power OK (inverted PFO), write: PFO interrupt mask  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlRegister(pub u8);

impl ControlRegister {
    const READY: u8 = 0x01;
    const PAGE_MASK: u8 = 0x3F;
    const OFFBOARD: u8 = 0x40;
    const PFO: u8 = 0x80;

    /// Window on page 0, on-board code memory, power-fail interrupt masked
    pub const BOOT_DEFAULT: ControlRegister = ControlRegister(Self::PFO);

    /// Written repeatedly at power-on until bit 0 reads back set
    pub const READY_PROBE: ControlRegister = ControlRegister(0x81);

    /// Bit 0 reads back set once the memory controller is out of reset
    pub fn ready(self) -> bool {
        self.0 & Self::READY != 0
    }

    pub fn page(self) -> u8 {
        self.0 & Self::PAGE_MASK
    }

    pub fn set_page(&mut self, page: u8) {
        self.0 = (self.0 & !Self::PAGE_MASK) | (page & Self::PAGE_MASK);
    }

    pub fn offboard_memory(self) -> bool {
        self.0 & Self::OFFBOARD != 0
    }

    pub fn set_offboard_memory(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::OFFBOARD;
        } else {
            self.0 &= !Self::OFFBOARD;
        }
    }

    pub fn power_ok(self) -> bool {
        self.0 & Self::PFO != 0
    }
}

/// Power-on handshake with the memory controller: keep writing the ready
/// probe until it reads back with bit 0 set, then load the boot default.
/// `access` writes the register and returns what it reads back.
pub fn bring_up(mut access: impl FnMut(ControlRegister) -> ControlRegister) -> ControlRegister {
    while !access(ControlRegister::READY_PROBE).ready() {}
    access(ControlRegister::BOOT_DEFAULT)
}

// ============================================================================
// Board Trait
// ============================================================================

/// Everything the dispatcher does to the board outside of serial and flash
pub trait Board {
    /// Wait for the memory controller, load the control register default,
    /// start the UART and tick timer and enable interrupts
    fn init(&mut self);

    /// Disable interrupts and stop the UART and both timers
    fn quiesce(&mut self);

    /// Set the off-board memory bit so the application image answers at the
    /// reset vector
    fn map_application(&mut self);

    /// Jump to address 0. There is no way back.
    fn jump_to_reset_vector(&mut self) -> !;
}

// ============================================================================
// Handoff
// ============================================================================

/// What remains once the bootloader has shut itself down. The dispatcher is
/// gone; the only thing left to do is jump.
pub struct Handoff<B: BankedBus, D: Board> {
    flash: FlashDriver<B>,
    board: D,
}

impl<B: BankedBus, D: Board> Handoff<B, D> {
    pub(crate) fn new(flash: FlashDriver<B>, board: D) -> Self {
        Handoff { flash, board }
    }

    pub fn flash(&self) -> &FlashDriver<B> {
        &self.flash
    }

    #[cfg(test)]
    pub fn board(&self) -> &D {
        &self.board
    }

    pub fn jump(mut self) -> ! {
        self.board.jump_to_reset_vector()
    }
}
