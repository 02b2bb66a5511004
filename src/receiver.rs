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

//! XMODEM-CRC receiver that writes every accepted block into flash

use std::marker::PhantomData;
use crate::config::{BootConfig, Budget};
use crate::crc::Crc16;
use crate::flash::{FlashError, FlashMemory, BANK_SIZE};
use crate::protocol::*;
use crate::serial::{Channel, LinkError, Wait};
use crate::tick::TICK_HZ;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum ReceiverError {
    Link(LinkError),
    Flash(FlashError),
    TransferComplete { programmed: u32 },
    /// Header byte that is none of SOH, EOT or ETB
    Aborted { header: u8 },
    /// Block number out of order (strict mode only)
    Sequence { expected: u8, received: u8 },
}

impl std::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverError::Link(e) => write!(f, "link error: {}", e),
            ReceiverError::Flash(e) => write!(f, "flash error: {}", e),
            ReceiverError::TransferComplete { programmed } => {
                write!(f, "Transfer complete ({} bytes programmed)", programmed)
            }
            ReceiverError::Aborted { header } => {
                write!(f, "transfer aborted on header 0x{:02X}", header)
            }
            ReceiverError::Sequence { expected, received } => {
                write!(f, "expected block {}, received block {}", expected, received)
            }
        }
    }
}

impl std::error::Error for ReceiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiverError::Link(e) => Some(e),
            ReceiverError::Flash(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LinkError> for ReceiverError {
    fn from(err: LinkError) -> Self {
        ReceiverError::Link(err)
    }
}

impl From<FlashError> for ReceiverError {
    fn from(err: FlashError) -> Self {
        ReceiverError::Flash(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Erasing;
pub struct AwaitHost;
pub struct ReceiveHeader;
pub struct ReceivePacket;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<'a, State> {
    state: PhantomData<State>,
    channel: &'a mut dyn Channel,
    flash: &'a mut dyn FlashMemory,
    block_buffer: [u8; BLOCK_SIZE],
    /// Next flash address to program; only ever moves forward
    address: u32,
    budget: Budget,
    programmed: u32,
    /// A NAK went out and the host owes us the same block again
    retry_requested: bool,
    expected_block: u8,
    blocks_accepted: u32,
    strict_sequence: bool,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState<'a> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S> ReceiverFsm<'a, S> {
    fn transition<T>(self) -> Box<ReceiverFsm<'a, T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            channel: self.channel,
            flash: self.flash,
            block_buffer: self.block_buffer,
            address: self.address,
            budget: self.budget,
            programmed: self.programmed,
            retry_requested: self.retry_requested,
            expected_block: self.expected_block,
            blocks_accepted: self.blocks_accepted,
            strict_sequence: self.strict_sequence,
            debug: self.debug,
        })
    }

    fn program_block(&mut self) -> Result<(), FlashError> {
        for i in 0..BLOCK_SIZE {
            if self.address >= BANK_SIZE || !self.budget.take() {
                break;
            }
            self.flash.program_byte(self.address, self.block_buffer[i])?;
            self.address += 1;
            self.programmed += 1;
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, Erasing> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        if fsm.debug { println!("Erasing flash..."); }
        fsm.flash.erase_all_sectors()?;
        if fsm.debug { println!("Erase complete"); }

        let next = fsm.transition::<AwaitHost>();
        Ok(next as Box<dyn ReceiverState<'a> + 'a>)
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, AwaitHost> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        fsm.channel.send(HANDSHAKE)?;
        if fsm.debug { println!("Sent: 'C'"); }

        if fsm.channel.poll(Wait::Ticks(TICK_HZ))? {
            let next = fsm.transition::<ReceiveHeader>();
            Ok(next as Box<dyn ReceiverState<'a> + 'a>)
        } else {
            if fsm.debug { println!("No sender yet"); }
            Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>)
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceiveHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        match fsm.channel.receive()? {
            SOH => {
                if fsm.debug { println!("Received: SOH"); }
                let next = fsm.transition::<ReceivePacket>();
                Ok(next as Box<dyn ReceiverState<'a> + 'a>)
            }
            header @ (EOT | ETB) => {
                if fsm.debug {
                    println!("Received: {}", if header == EOT { "EOT" } else { "ETB" });
                }
                fsm.channel.send(ACK)?;
                if fsm.debug { println!("Sent: ACK"); }
                Err(ReceiverError::TransferComplete { programmed: fsm.programmed })
            }
            header => {
                if fsm.debug {
                    let kind = if header == CAN { "cancel" } else { "invalid header" };
                    println!("Received {} 0x{:02X}, aborting", kind, header);
                }
                Err(ReceiverError::Aborted { header })
            }
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceivePacket> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        let block = fsm.channel.receive()?;
        let n_block = fsm.channel.receive()?;

        let mut crc = Crc16::new();
        for i in 0..BLOCK_SIZE {
            let byte = fsm.channel.receive()?;
            fsm.block_buffer[i] = byte;
            crc.update(byte);
        }

        let mut remote_crc = fsm.channel.receive()? as u16;
        remote_crc = (remote_crc << 8) | fsm.channel.receive()? as u16;

        if fsm.debug {
            println!("Received: block {} (~{}), CRC 0x{:04X}, expected 0x{:04X}",
                     block, n_block, remote_crc, crc.value());
        }

        if crc.value() != remote_crc {
            fsm.channel.send(NAK)?;
            if fsm.debug { println!("CRC mismatch, sent: NAK"); }
            fsm.retry_requested = true;
            let next = fsm.transition::<ReceiveHeader>();
            return Ok(next as Box<dyn ReceiverState<'a> + 'a>);
        }

        if fsm.strict_sequence {
            if n_block != !block {
                fsm.channel.send(NAK)?;
                if fsm.debug { println!("Block number complement mismatch, sent: NAK"); }
                fsm.retry_requested = true;
                let next = fsm.transition::<ReceiveHeader>();
                return Ok(next as Box<dyn ReceiverState<'a> + 'a>);
            }

            if fsm.blocks_accepted > 0 && block == fsm.expected_block.wrapping_sub(1) {
                // Our ACK got lost; the data is already in flash
                fsm.channel.send(ACK)?;
                if fsm.debug { println!("Duplicate block {}, sent: ACK", block); }
                let next = fsm.transition::<ReceiveHeader>();
                return Ok(next as Box<dyn ReceiverState<'a> + 'a>);
            }

            if block != fsm.expected_block {
                if fsm.debug { println!("Expected block {}, aborting", fsm.expected_block); }
                return Err(ReceiverError::Sequence { expected: fsm.expected_block, received: block });
            }
        }

        if fsm.retry_requested && fsm.debug { println!("Retransmission accepted"); }
        fsm.retry_requested = false;

        fsm.program_block()?;
        fsm.blocks_accepted += 1;
        fsm.expected_block = fsm.expected_block.wrapping_add(1);

        fsm.channel.send(ACK)?;
        if fsm.debug { println!("Programmed up to 0x{:05X}, sent: ACK", fsm.address); }

        let next = fsm.transition::<ReceiveHeader>();
        Ok(next as Box<dyn ReceiverState<'a> + 'a>)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ReceiverFsm<'a, Erasing> {
    pub fn new(
        channel: &'a mut dyn Channel,
        flash: &'a mut dyn FlashMemory,
        config: &BootConfig,
    ) -> Box<dyn ReceiverState<'a> + 'a> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Erasing>,
            channel,
            flash,
            block_buffer: [0; BLOCK_SIZE],
            address: 0,
            budget: config.program_budget,
            programmed: 0,
            retry_requested: false,
            expected_block: 1,
            blocks_accepted: 0,
            strict_sequence: config.strict_sequence,
            debug: config.debug,
        })
    }
}

/// Step the receiver to the end. Returns the number of bytes programmed.
pub fn run<'a>(mut fsm: Box<dyn ReceiverState<'a> + 'a>) -> Result<u32, ReceiverError> {
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(ReceiverError::TransferComplete { programmed }) => return Ok(programmed),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc;
    use crate::device::SimulatedFlash;
    use crate::flash::FlashDriver;
    use crate::serial::MockChannel;

    fn packet(block: u8, complement: u8, payload: &[u8; BLOCK_SIZE], crc: u16) -> Vec<Option<u8>> {
        let mut bytes = vec![Some(SOH), Some(block), Some(complement)];
        bytes.extend(payload.iter().map(|&b| Some(b)));
        bytes.push(Some((crc >> 8) as u8));
        bytes.push(Some(crc as u8));
        bytes
    }

    fn good_packet(block: u8, payload: &[u8; BLOCK_SIZE]) -> Vec<Option<u8>> {
        packet(block, !block, payload, crc::checksum(payload))
    }

    fn payload(seed: u8) -> [u8; BLOCK_SIZE] {
        let mut data = [0u8; BLOCK_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        data
    }

    fn dirty_flash() -> FlashDriver<SimulatedFlash> {
        let image = vec![0u8; BANK_SIZE as usize];
        FlashDriver::new(SimulatedFlash::from_image(&image).unwrap(), Some(1000))
    }

    fn debug_config() -> BootConfig {
        BootConfig { debug: true, ..BootConfig::default() }
    }

    #[test]
    fn test_eot_right_after_erase() {
        let mut channel = MockChannel::bytes(&[EOT], vec![HANDSHAKE, ACK]);
        let mut flash = dirty_flash();

        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &debug_config()));

        assert_eq!(result.unwrap(), 0);
        assert_eq!(flash.bus().sectors_erased(), 128);
        assert_eq!(flash.bus().bytes_programmed(), 0);
        assert!(flash.bus().image().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_etb_also_ends_transfer() {
        let mut channel = MockChannel::bytes(&[ETB], vec![HANDSHAKE, ACK]);
        let mut flash = dirty_flash();
        assert_eq!(run(ReceiverFsm::new(&mut channel, &mut flash, &debug_config())).unwrap(), 0);
    }

    #[test]
    fn test_handshake_repeats_until_host_answers() {
        let data = payload(1);
        let mut responses = vec![None, None];
        responses.extend(good_packet(1, &data));
        responses.push(Some(EOT));

        let expected_writes = vec![HANDSHAKE, HANDSHAKE, HANDSHAKE, ACK, ACK];

        let mut channel = MockChannel::new(responses, expected_writes);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &debug_config()));

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&flash.bus().image()[..128], &data[..]);
    }

    #[test]
    fn test_bad_crc_is_nacked_and_never_written() {
        let data = payload(2);
        let good_crc = crc::checksum(&data);

        let mut responses = packet(1, 0xFE, &data, good_crc ^ 0x0100);
        responses.extend(good_packet(1, &data));
        responses.push(Some(EOT));

        let expected_writes = vec![HANDSHAKE, NAK, ACK, ACK];

        let mut channel = MockChannel::new(responses, expected_writes);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &debug_config()));

        assert_eq!(result.unwrap(), 128);
        assert_eq!(flash.bus().bytes_programmed(), 128);
        assert_eq!(&flash.bus().image()[..128], &data[..]);
        assert!(flash.bus().image()[128..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_corrupted_payload_is_nacked() {
        let data = payload(3);
        let mut corrupted = data;
        corrupted[64] ^= 0x80;

        let mut responses = packet(1, 0xFE, &corrupted, crc::checksum(&data));
        responses.push(Some(EOT));

        let mut channel = MockChannel::new(responses, vec![HANDSHAKE, NAK, ACK]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &BootConfig::default()));

        assert_eq!(result.unwrap(), 0);
        assert_eq!(flash.bus().bytes_programmed(), 0);
    }

    #[test]
    fn test_multiple_blocks_are_contiguous() {
        let mut responses = Vec::new();
        let mut image = Vec::new();
        for block in 1..=3u8 {
            let data = payload(block);
            responses.extend(good_packet(block, &data));
            image.extend_from_slice(&data);
        }
        responses.push(Some(EOT));

        let expected_writes = vec![HANDSHAKE, ACK, ACK, ACK, ACK];

        let mut channel = MockChannel::new(responses, expected_writes);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &BootConfig::default()));

        assert_eq!(result.unwrap(), 384);
        assert_eq!(&flash.bus().image()[..384], &image[..]);
    }

    #[test]
    fn test_unknown_header_aborts_silently() {
        let mut channel = MockChannel::bytes(&[CAN], vec![HANDSHAKE]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &debug_config()));
        assert!(matches!(result, Err(ReceiverError::Aborted { header: CAN })));
    }

    #[test]
    fn test_block_numbers_ignored_by_default() {
        let data = payload(4);
        let mut responses = packet(7, 0x00, &data, crc::checksum(&data));
        responses.extend(packet(7, 0x00, &data, crc::checksum(&data)));
        responses.push(Some(EOT));

        let mut channel = MockChannel::new(responses, vec![HANDSHAKE, ACK, ACK, ACK]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &BootConfig::default()));

        // Both copies land back to back
        assert_eq!(result.unwrap(), 256);
        assert_eq!(&flash.bus().image()[128..256], &data[..]);
    }

    #[test]
    fn test_strict_mode_acks_duplicate_without_reprogramming() {
        let first = payload(5);
        let second = payload(6);
        let mut responses = good_packet(1, &first);
        responses.extend(good_packet(1, &first));
        responses.extend(good_packet(2, &second));
        responses.push(Some(EOT));

        let config = BootConfig { strict_sequence: true, debug: true, ..BootConfig::default() };
        let mut channel = MockChannel::new(responses, vec![HANDSHAKE, ACK, ACK, ACK, ACK]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &config));

        assert_eq!(result.unwrap(), 256);
        assert_eq!(&flash.bus().image()[..128], &first[..]);
        assert_eq!(&flash.bus().image()[128..256], &second[..]);
    }

    #[test]
    fn test_strict_mode_nacks_bad_complement() {
        let data = payload(7);
        let mut responses = packet(1, 0x00, &data, crc::checksum(&data));
        responses.extend(good_packet(1, &data));
        responses.push(Some(EOT));

        let config = BootConfig { strict_sequence: true, ..BootConfig::default() };
        let mut channel = MockChannel::new(responses, vec![HANDSHAKE, NAK, ACK, ACK]);
        let mut flash = dirty_flash();
        assert_eq!(run(ReceiverFsm::new(&mut channel, &mut flash, &config)).unwrap(), 128);
    }

    #[test]
    fn test_strict_mode_aborts_out_of_order_block() {
        let data = payload(8);
        let responses = good_packet(3, &data);

        let config = BootConfig { strict_sequence: true, ..BootConfig::default() };
        let mut channel = MockChannel::new(responses, vec![HANDSHAKE]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &config));

        assert!(matches!(result, Err(ReceiverError::Sequence { expected: 1, received: 3 })));
        assert_eq!(flash.bus().bytes_programmed(), 0);
    }

    #[test]
    fn test_limited_budget_stops_programming() {
        let data = payload(9);
        let mut responses = good_packet(1, &data);
        responses.extend(good_packet(2, &data));
        responses.push(Some(EOT));

        let config = BootConfig { program_budget: Budget::Limited(200), ..BootConfig::default() };
        let mut channel = MockChannel::new(responses, vec![HANDSHAKE, ACK, ACK, ACK]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &config));

        assert_eq!(result.unwrap(), 200);
        assert_eq!(flash.bus().image()[199], data[71]);
        assert_eq!(flash.bus().image()[200], 0xFF);
    }

    #[test]
    fn test_hung_flash_is_fatal() {
        let mut device = SimulatedFlash::new();
        device.set_stuck(true);
        let mut flash = FlashDriver::new(device, Some(32));
        let mut channel = MockChannel::new(vec![], vec![]);

        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &BootConfig::default()));
        assert!(matches!(
            result,
            Err(ReceiverError::Flash(FlashError::HardwareFault { address: 0 }))
        ));
    }

    #[test]
    fn test_host_vanishing_mid_packet() {
        let data = payload(10);
        let mut responses = good_packet(1, &data);
        responses.truncate(40);

        let mut channel = MockChannel::new(responses, vec![HANDSHAKE]);
        let mut flash = dirty_flash();
        let result = run(ReceiverFsm::new(&mut channel, &mut flash, &BootConfig::default()));
        assert!(matches!(result, Err(ReceiverError::Link(LinkError::Disconnected))));
    }
}
