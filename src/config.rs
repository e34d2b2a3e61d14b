// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Build-time configuration for one chip model.

use std::time::Duration;
use crate::geometry::{Geometry, MX25R6435F};
use crate::Result;

/// Line width used for the address and data phases of array reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// FastRead 0x0B, 1-1-1.
    Single,
    /// 2READ 0xBB, 1-2-2.
    Dual,
    /// 4READ 0xEB, 1-4-4, with a "no performance enhance" mode byte.
    Quad,
}

/// Line width used for the address and data phases of page programs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgramMode {
    /// PP 0x02, 1-1-1.
    Single,
    /// 4PP 0x38, 1-4-4.
    Quad,
}

/// Dummy clock cycles between the address (or mode byte) and data phases
/// of an array read, for each read line width.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DummyCycles {
    pub single: u8,
    pub dual: u8,
    pub quad: u8,
}

impl DummyCycles {
    pub fn for_mode(&self, mode: ReadMode) -> u8 {
        match mode {
            ReadMode::Single => self.single,
            ReadMode::Dual => self.dual,
            ReadMode::Quad => self.quad,
        }
    }
}

/// Maximum durations of each class of operation.
///
/// Status polling gives up after the duration matching the operation
/// in progress, so full-chip erase is allowed far longer than a page
/// program or a register write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Link timeout for a command phase or a blocking data phase,
    /// and the poll limit for register writes and write-enable.
    pub command: Duration,
    /// Wait limit for an interrupt-driven data phase to complete.
    pub transfer: Duration,
    pub page_program: Duration,
    pub sector_erase: Duration,
    pub block_erase: Duration,
    pub chip_erase: Duration,
    /// Delay between consecutive status register reads while polling.
    pub poll_interval: Duration,
}

/// Full driver configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub geometry: Geometry,
    pub timing: Timing,
    pub dummy_cycles: DummyCycles,
    pub read_mode: ReadMode,
    pub program_mode: ProgramMode,
    /// Mode byte sent after the address in quad reads, which must not
    /// match the 0xA5 performance-enhance pattern.
    pub no_enhance_mode_byte: u8,
}

impl Config {
    /// Configuration for the Macronix MX25R6435F in quad mode.
    pub fn mx25r6435f() -> Self {
        Config {
            geometry: MX25R6435F,
            timing: Timing {
                command: Duration::from_millis(5000),
                transfer: Duration::from_millis(5000),
                page_program: Duration::from_millis(5000),
                sector_erase: Duration::from_millis(240),
                block_erase: Duration::from_millis(3500),
                chip_erase: Duration::from_millis(240_000),
                poll_interval: Duration::from_micros(10),
            },
            dummy_cycles: DummyCycles { single: 8, dual: 4, quad: 4 },
            read_mode: ReadMode::Quad,
            program_mode: ProgramMode::Quad,
            no_enhance_mode_byte: 0xAA,
        }
    }

    /// Check the configured geometry is usable.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::mx25r6435f()
    }
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.dummy_cycles.for_mode(ReadMode::Quad), 4);
    assert_eq!(config.dummy_cycles.for_mode(ReadMode::Single), 8);
    assert!(config.timing.chip_erase > config.timing.block_erase);
    assert!(config.timing.block_erase > config.timing.sector_erase);
}
