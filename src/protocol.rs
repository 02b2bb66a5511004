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

//! XMODEM and bootloader command constants

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// End of transmission - sender has no more blocks
pub const EOT: u8 = 0x04;

/// Acknowledge - block accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - block rejected, send it again
pub const NAK: u8 = 0x15;

/// End of transmission block - final close of the transfer
pub const ETB: u8 = 0x17;

/// Cancel - ends a programming session like any other unknown header
pub const CAN: u8 = 0x18;

/// 'C' - receiver ready for a CRC-16 transfer
pub const HANDSHAKE: u8 = b'C';

/// Payload bytes carried by every block
pub const BLOCK_SIZE: usize = 128;

/// Full packet: header, sequence, complement, payload, two CRC bytes
#[cfg(test)]
pub const PACKET_SIZE: usize = 3 + BLOCK_SIZE + 2;

/// Command: erase flash and receive a new image over XMODEM
pub const CMD_PROGRAM: u8 = b'P';

/// Command: send the 64 KiB code bank over XMODEM
pub const CMD_UPLOAD_CODE: u8 = b'U';

/// Command: send the full 512 KiB banked space over XMODEM
pub const CMD_DUMP_FULL: u8 = b'D';

/// Command: leave the bootloader and start the application
pub const CMD_BOOT: u8 = b'B';

/// Reply to any unrecognized command byte
pub const NOT_RECOGNIZED: u8 = b'N';

/// End of the code bank dumped by `CMD_UPLOAD_CODE`
pub const CODE_BANK_END: u32 = 0x10000;

/// End of the banked space dumped by `CMD_DUMP_FULL`
pub const FULL_BANK_END: u32 = 0x80000;
