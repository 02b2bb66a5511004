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

// Serial XMODEM bootloader for a banked-flash board
mod board;
mod config;
mod crc;
mod device;
mod dispatcher;
mod flash;
mod host;
mod protocol;
mod receiver;
mod ring;
mod sender;
mod serial;
mod tick;
mod transport;

use clap::Parser;
use std::path::PathBuf;
use config::{BootConfig, Budget};
use device::SimulatedFlash;
use dispatcher::Bootloader;
use flash::FlashDriver;
use host::EmulatedBoard;
use serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "evnboot")]
#[command(about = "XMODEM bootloader running on an emulated banked-flash board", long_about = None)]
struct Cli {
    /// Serial port the board's UART is wired to (e.g., /dev/ttyUSB0 or a pty)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "57600")]
    baud: u32,

    /// Flash image backing the simulated chip (created if missing)
    #[arg(short, long, default_value = "flash.bin", value_name = "FILE")]
    image: PathBuf,

    /// Stay in the bootloader after a full-bank dump instead of booting
    #[arg(long)]
    no_dump_fallthrough: bool,

    /// Validate XMODEM block numbers while programming
    #[arg(long)]
    strict_sequence: bool,

    /// Status reads before a flash operation counts as hung
    #[arg(long, value_name = "READS")]
    poll_limit: Option<u32>,

    /// Maximum number of bytes a programming session may write
    #[arg(long, value_name = "BYTES")]
    program_limit: Option<u32>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn boot_config(&self) -> BootConfig {
        BootConfig {
            dump_full_then_boot: !self.no_dump_fallthrough,
            strict_sequence: self.strict_sequence,
            flash_poll_limit: self.poll_limit,
            program_budget: match self.program_limit {
                Some(limit) => Budget::Limited(limit),
                None => Budget::Unbounded,
            },
            debug: self.debug,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let config = cli.boot_config();

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, 8N1", cli.baud);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    let device = match SimulatedFlash::open(&cli.image) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Failed to load flash image {}: {}", cli.image.display(), e);
            std::process::exit(1);
        }
    };
    println!("Flash image: {}", cli.image.display());

    let board = EmulatedBoard::new(serial_port, cli.debug);
    let link = board.link();
    let flash = FlashDriver::new(device, config.flash_poll_limit);

    match Bootloader::new(link, flash, board, config).run() {
        Ok(handoff) => {
            if let Err(e) = handoff.flash().bus().save(&cli.image) {
                eprintln!("Failed to save flash image: {}", e);
                std::process::exit(1);
            }
            let chip = handoff.flash().bus();
            println!(
                "\nFlash image saved ({} sectors erased, {} bytes programmed), starting application",
                chip.sectors_erased(),
                chip.bytes_programmed()
            );
            handoff.jump()
        }
        Err(halted) => {
            eprintln!("Bootloader halted: {}", halted.error);
            if let Err(e) = halted.flash.bus().save(&cli.image) {
                eprintln!("Failed to save flash image: {}", e);
            }
            std::process::exit(1);
        }
    }
}
