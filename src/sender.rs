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

//! XMODEM-CRC sender that streams banked flash to the host

use std::marker::PhantomData;
use crate::crc;
use crate::flash::{FlashError, FlashMemory};
use crate::protocol::*;
use crate::serial::{Channel, LinkError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum SenderError {
    Link(LinkError),
    Flash(FlashError),
    TransferComplete { blocks: u32 },
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderError::Link(e) => write!(f, "link error: {}", e),
            SenderError::Flash(e) => write!(f, "flash error: {}", e),
            SenderError::TransferComplete { blocks } => {
                write!(f, "Transfer complete ({} blocks)", blocks)
            }
        }
    }
}

impl std::error::Error for SenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SenderError::Link(e) => Some(e),
            SenderError::Flash(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LinkError> for SenderError {
    fn from(err: LinkError) -> Self {
        SenderError::Link(err)
    }
}

impl From<FlashError> for SenderError {
    fn from(err: FlashError) -> Self {
        SenderError::Flash(err)
    }
}

// ============================================================================
// Dump Range
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpRange {
    /// The 64 KiB code bank
    CodeBank,
    /// All 512 KiB of banked flash
    FullBank,
}

impl DumpRange {
    pub fn end(self) -> u32 {
        match self {
            DumpRange::CodeBank => CODE_BANK_END,
            DumpRange::FullBank => FULL_BANK_END,
        }
    }
}

/// XMODEM block number for the block starting at `address`, 1-based and
/// wrapping at 256
pub fn block_number(address: u32) -> u8 {
    ((address >> 7) + 1) as u8
}

// ============================================================================
// States
// ============================================================================

pub struct WaitHandshake;
pub struct TransmitBlock;
pub struct AwaitAck;
pub struct EndTransmission;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<'a, State> {
    state: PhantomData<State>,
    channel: &'a mut dyn Channel,
    flash: &'a mut dyn FlashMemory,
    address: u32,
    end: u32,
    buffer: [u8; BLOCK_SIZE],
    crc: u16,
    retransmit: bool,
    blocks: u32,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState<'a> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState<'a> + 'a>, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S> SenderFsm<'a, S> {
    fn transition<T>(self) -> Box<SenderFsm<'a, T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            channel: self.channel,
            flash: self.flash,
            address: self.address,
            end: self.end,
            buffer: self.buffer,
            crc: self.crc,
            retransmit: self.retransmit,
            blocks: self.blocks,
            debug: self.debug,
        })
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> SenderState<'a> for SenderFsm<'a, WaitHandshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState<'a> + 'a>, SenderError> {
        let mut fsm = *self;

        let byte = fsm.channel.receive()?;
        if byte == HANDSHAKE {
            if fsm.debug { println!("Received: 'C'"); }
            let next = fsm.transition::<TransmitBlock>();
            Ok(next as Box<dyn SenderState<'a> + 'a>)
        } else {
            if fsm.debug { println!("Waiting for 'C', got 0x{:02X}", byte); }
            Ok(Box::new(fsm) as Box<dyn SenderState<'a> + 'a>)
        }
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, TransmitBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState<'a> + 'a>, SenderError> {
        let mut fsm = *self;

        if fsm.address >= fsm.end {
            let next = fsm.transition::<EndTransmission>();
            return Ok(next as Box<dyn SenderState<'a> + 'a>);
        }

        if fsm.retransmit {
            fsm.retransmit = false;
            if fsm.debug { println!("Retransmitting block at 0x{:05X}", fsm.address); }
        } else {
            fsm.flash.read_block(fsm.address, &mut fsm.buffer)?;
            fsm.crc = crc::checksum(&fsm.buffer);
        }

        let block = block_number(fsm.address);
        fsm.channel.send_all(&[SOH, block, !block])?;
        fsm.channel.send_all(&fsm.buffer)?;
        fsm.channel.send_all(&fsm.crc.to_be_bytes())?;
        if fsm.debug {
            println!("Sent: block {} (0x{:05X}), CRC 0x{:04X}", block, fsm.address, fsm.crc);
        }

        let next = fsm.transition::<AwaitAck>();
        Ok(next as Box<dyn SenderState<'a> + 'a>)
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState<'a> + 'a>, SenderError> {
        let mut fsm = *self;

        let response = fsm.channel.receive()?;
        if response == ACK {
            fsm.address += BLOCK_SIZE as u32;
            fsm.blocks += 1;
        } else {
            if fsm.debug { println!("Received: 0x{:02X} instead of ACK", response); }
            fsm.retransmit = true;
        }

        let next = fsm.transition::<TransmitBlock>();
        Ok(next as Box<dyn SenderState<'a> + 'a>)
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, EndTransmission> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState<'a> + 'a>, SenderError> {
        let mut fsm = *self;

        // The host's answers to EOT and ETB are read but not judged
        fsm.channel.send(EOT)?;
        if fsm.debug { println!("Sent: EOT"); }
        fsm.channel.receive()?;

        fsm.channel.send(ETB)?;
        if fsm.debug { println!("Sent: ETB"); }
        fsm.channel.receive()?;

        Err(SenderError::TransferComplete { blocks: fsm.blocks })
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> SenderFsm<'a, WaitHandshake> {
    pub fn new(
        channel: &'a mut dyn Channel,
        flash: &'a mut dyn FlashMemory,
        range: DumpRange,
        debug: bool,
    ) -> Box<dyn SenderState<'a> + 'a> {
        Box::new(SenderFsm {
            state: PhantomData::<WaitHandshake>,
            channel,
            flash,
            address: 0,
            end: range.end(),
            buffer: [0; BLOCK_SIZE],
            crc: 0,
            retransmit: false,
            blocks: 0,
            debug,
        })
    }
}

/// Step the sender to the end. Returns the number of blocks acknowledged.
pub fn run<'a>(mut fsm: Box<dyn SenderState<'a> + 'a>) -> Result<u32, SenderError> {
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(SenderError::TransferComplete { blocks }) => return Ok(blocks),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
