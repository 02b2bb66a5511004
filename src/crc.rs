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

//! CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first, no final XOR

const POLYNOMIAL: u16 = 0x1021;

/// Running CRC over a stream of bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16 {
    value: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Crc16 { value: 0 }
    }

    pub fn update(&mut self, byte: u8) {
        self.value = update(self.value, byte);
    }

    pub fn value(&self) -> u16 {
        self.value
    }
}

/// Fold one byte into `crc`, bit by bit
pub fn update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ POLYNOMIAL
        } else {
            crc << 1
        };
    }
    crc
}

pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| update(crc, b))
}
