// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Fixed geometry of a NOR flash chip model.

use crate::{Error, Result};

/// Size and erase/program granularity of a flash chip.
///
/// All sizes are in bytes. A valid geometry has a capacity which is an
/// exact multiple of the block size, and block and sector sizes which are
/// exact multiples of the page size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Total memory capacity.
    pub capacity: usize,
    /// Page program size; no program command may cross a page boundary.
    pub page_size: usize,
    /// Smallest erase unit, erased with the sector erase instruction.
    pub sector_size: usize,
    /// Erase unit presented to the flash-translation layer as one block.
    pub block_size: usize,
}

/// Macronix MX25R6435F, 64Mbit quad-SPI NOR flash.
pub const MX25R6435F: Geometry = Geometry {
    capacity: 8 * 1024 * 1024,
    page_size: 256,
    sector_size: 4 * 1024,
    block_size: 64 * 1024,
};

impl Geometry {
    /// Check the size invariants hold.
    pub fn validate(&self) -> Result<()> {
        let ok = self.page_size > 0
            && self.sector_size >= self.page_size
            && self.block_size >= self.sector_size
            && self.capacity >= self.block_size
            && self.sector_size % self.page_size == 0
            && self.block_size % self.page_size == 0
            && self.block_size % self.sector_size == 0
            && self.capacity % self.block_size == 0
            // Addresses are always sent as 3 bytes.
            && self.capacity <= 1 << 24;
        if ok {
            Ok(())
        } else {
            log::error!("Invalid flash geometry: {:?}", self);
            Err(Error::UnsupportedGeometry { address: 0, length: self.capacity })
        }
    }

    /// Number of erase blocks in the chip.
    pub fn total_blocks(&self) -> usize {
        self.capacity / self.block_size
    }

    /// Number of erase sectors in the chip.
    pub fn total_sectors(&self) -> usize {
        self.capacity / self.sector_size
    }

    /// Number of program pages in the chip.
    pub fn total_pages(&self) -> usize {
        self.capacity / self.page_size
    }

    /// Base address of erase block `index`.
    pub fn block_address(&self, index: usize) -> Result<u32> {
        if index < self.total_blocks() {
            Ok((index * self.block_size) as u32)
        } else {
            log::error!("Block {} out of range, chip has {} blocks", index, self.total_blocks());
            Err(Error::UnsupportedGeometry { address: index * self.block_size, length: self.block_size })
        }
    }

    /// Base address of erase sector `index`.
    pub fn sector_address(&self, index: usize) -> Result<u32> {
        if index < self.total_sectors() {
            Ok((index * self.sector_size) as u32)
        } else {
            log::error!("Sector {} out of range, chip has {} sectors", index, self.total_sectors());
            Err(Error::UnsupportedGeometry { address: index * self.sector_size, length: self.sector_size })
        }
    }

    /// Checks `[address, address+length)` lies entirely within the chip.
    pub fn check_range(&self, address: u32, length: usize) -> Result<()> {
        let start = address as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => {
                log::error!("Range 0x{:08X}+{} exceeds flash capacity {}",
                            address, length, self.capacity);
                Err(Error::UnsupportedGeometry { address: start, length })
            }
        }
    }
}

#[test]
fn test_mx25r6435f_geometry() {
    assert!(MX25R6435F.validate().is_ok());
    assert_eq!(MX25R6435F.total_blocks(), 128);
    assert_eq!(MX25R6435F.total_sectors(), 2048);
    assert_eq!(MX25R6435F.total_pages(), 32768);
}

#[test]
fn test_invalid_geometry() {
    let g = Geometry { capacity: 1000, page_size: 256, sector_size: 4096, block_size: 65536 };
    assert!(g.validate().is_err());
    let g = Geometry { capacity: 65536, page_size: 300, sector_size: 4096, block_size: 65536 };
    assert!(g.validate().is_err());
    let g = Geometry { page_size: 0, ..MX25R6435F };
    assert!(g.validate().is_err());
}

#[test]
fn test_capacity_limited_to_3_byte_addresses() {
    assert!(Geometry { capacity: 16 * 1024 * 1024, ..MX25R6435F }.validate().is_ok());
    let g = Geometry { capacity: 32 * 1024 * 1024, ..MX25R6435F };
    assert!(matches!(g.validate(),
                     Err(Error::UnsupportedGeometry { length, .. }) if length == 32 * 1024 * 1024));
}

#[test]
fn test_check_range() {
    let g = MX25R6435F;
    assert!(g.check_range(0, g.capacity).is_ok());
    assert!(g.check_range(g.capacity as u32 - 1, 1).is_ok());
    assert!(g.check_range(g.capacity as u32 - 1, 2).is_err());
    assert!(g.check_range(g.capacity as u32, 0).is_ok());
    assert!(g.check_range(u32::MAX, 2).is_err());
}

#[test]
fn test_block_and_sector_addresses() {
    let g = MX25R6435F;
    assert_eq!(g.block_address(0).unwrap(), 0);
    assert_eq!(g.block_address(3).unwrap(), 0x30000);
    assert!(g.block_address(128).is_err());
    assert_eq!(g.sector_address(2047).unwrap(), 0x7FF000);
    assert!(g.sector_address(2048).is_err());
}
