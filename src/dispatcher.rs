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

//! Cold-start window and single-byte command loop

use crate::board::{Board, Handoff};
use crate::config::BootConfig;
use crate::flash::{BankedBus, FlashDriver, FlashError};
use crate::protocol::*;
use crate::receiver::{self, ReceiverError, ReceiverFsm};
use crate::sender::{self, DumpRange, SenderError, SenderFsm};
use crate::serial::{Channel, LinkError, Wait};
use crate::tick::TICK_HZ;

/// Ticks after power-on during which any byte keeps the bootloader resident
pub const COLD_START_TICKS: u16 = TICK_HZ;

// ============================================================================
// Error Types
// ============================================================================

/// Conditions that stop the command loop for good
#[derive(Debug)]
pub enum BootError {
    Link(LinkError),
    Flash(FlashError),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Link(e) => write!(f, "link error: {}", e),
            BootError::Flash(e) => write!(f, "flash error: {}", e),
        }
    }
}

impl std::error::Error for BootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootError::Link(e) => Some(e),
            BootError::Flash(e) => Some(e),
        }
    }
}

impl From<LinkError> for BootError {
    fn from(err: LinkError) -> Self {
        BootError::Link(err)
    }
}

/// A bootloader that stopped on an error. The flash is handed back so its
/// contents are not lost.
pub struct Halted<B: BankedBus> {
    pub error: BootError,
    pub flash: FlashDriver<B>,
}

// ============================================================================
// Bootloader
// ============================================================================

pub struct Bootloader<C: Channel, B: BankedBus, D: Board> {
    channel: C,
    flash: FlashDriver<B>,
    board: D,
    config: BootConfig,
}

impl<C: Channel, B: BankedBus, D: Board> Bootloader<C, B, D> {
    pub fn new(channel: C, flash: FlashDriver<B>, board: D, config: BootConfig) -> Self {
        Bootloader { channel, flash, board, config }
    }

    /// Bring up the board, then serve commands until a boot is requested.
    /// On success the board is quiesced and the application is mapped; all
    /// that is left is `Handoff::jump`.
    pub fn run(mut self) -> Result<Handoff<B, D>, Halted<B>> {
        match self.serve() {
            Ok(()) => {
                if self.config.debug { println!("Handing off to application"); }
                self.board.quiesce();
                self.board.map_application();
                Ok(Handoff::new(self.flash, self.board))
            }
            Err(error) => Err(Halted { error, flash: self.flash }),
        }
    }

    fn serve(&mut self) -> Result<(), BootError> {
        self.board.init();

        if !self.channel.poll(Wait::Ticks(COLD_START_TICKS))? {
            if self.config.debug { println!("No host within the cold-start window"); }
            return Ok(());
        }
        let wake = self.channel.receive()?;
        if self.config.debug { println!("Host present (0x{:02X}), staying resident", wake); }

        loop {
            let command = self.channel.receive()?;
            match command {
                CMD_PROGRAM => self.program()?,
                CMD_UPLOAD_CODE => self.dump(DumpRange::CodeBank)?,
                CMD_DUMP_FULL => {
                    self.dump(DumpRange::FullBank)?;
                    if self.config.dump_full_then_boot {
                        return Ok(());
                    }
                }
                CMD_BOOT => return Ok(()),
                other => {
                    if self.config.debug { println!("Unknown command 0x{:02X}", other); }
                    self.channel.send(NOT_RECOGNIZED)?;
                }
            }
        }
    }

    fn program(&mut self) -> Result<(), BootError> {
        if self.config.debug { println!("Command: program"); }
        let fsm = ReceiverFsm::new(&mut self.channel, &mut self.flash, &self.config);
        match receiver::run(fsm) {
            Ok(programmed) => {
                if self.config.debug { println!("Programmed {} bytes", programmed); }
                Ok(())
            }
            Err(ReceiverError::Link(e)) => Err(BootError::Link(e)),
            Err(ReceiverError::Flash(e)) => Err(BootError::Flash(e)),
            Err(e) => {
                if self.config.debug { println!("Programming abandoned: {}", e); }
                Ok(())
            }
        }
    }

    fn dump(&mut self, range: DumpRange) -> Result<(), BootError> {
        if self.config.debug { println!("Command: dump to 0x{:05X}", range.end()); }
        let fsm = SenderFsm::new(&mut self.channel, &mut self.flash, range, self.config.debug);
        match sender::run(fsm) {
            Ok(blocks) | Err(SenderError::TransferComplete { blocks }) => {
                if self.config.debug { println!("Sent {} blocks", blocks); }
                Ok(())
            }
            Err(SenderError::Link(e)) => Err(BootError::Link(e)),
            Err(SenderError::Flash(e)) => Err(BootError::Flash(e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
