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

/// How many bytes a programming session may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Accept until the host ends the transfer
    Unbounded,
    Limited(u32),
}

impl Budget {
    /// Take one byte from the budget. Returns `false` once it is spent.
    pub fn take(&mut self) -> bool {
        match self {
            Budget::Unbounded => true,
            Budget::Limited(0) => false,
            Budget::Limited(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// Runtime behavior switches for the bootloader
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// After a full-bank dump, carry on into the boot command as the
    /// legacy firmware does
    pub dump_full_then_boot: bool,
    /// Check block numbers and their complements while programming
    pub strict_sequence: bool,
    /// Status reads before a flash operation is declared hung
    pub flash_poll_limit: Option<u32>,
    pub program_budget: Budget,
    pub debug: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            dump_full_then_boot: true,
            strict_sequence: false,
            flash_poll_limit: None,
            program_budget: Budget::Unbounded,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_budget_never_runs_out() {
        let mut budget = Budget::Unbounded;
        assert!((0..100_000).all(|_| budget.take()));
    }

    #[test]
    fn test_limited_budget() {
        let mut budget = Budget::Limited(2);
        assert!(budget.take());
        assert!(budget.take());
        assert!(!budget.take());
        assert_eq!(budget, Budget::Limited(0));
    }

    #[test]
    fn test_defaults_match_legacy_firmware() {
        let config = BootConfig::default();
        assert!(config.dump_full_then_boot);
        assert!(!config.strict_sequence);
        assert_eq!(config.flash_poll_limit, None);
        assert_eq!(config.program_budget, Budget::Unbounded);
    }
}
