// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Splitting writes into page program operations.
//!
//! A page program which runs past the end of its page wraps around to the
//! start of the same page on this chip class, overwriting data already
//! programmed there. Every program command is therefore kept inside one page.

use std::ops::Range;
use crate::command::Operation;
use crate::link::Link;
use crate::status::Poller;
use crate::transport::{Data, Transport};
use crate::{Error, Result};

/// One page program: the flash address and the range of the source buffer
/// to write there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub address: u32,
    pub range: Range<usize>,
}

/// Iterator over the page-aligned chunks of a write.
///
/// The first chunk runs from the start address to the end of its page, or
/// the end of the data if sooner; each following chunk is one full page,
/// except the last, which holds whatever remains.
#[derive(Clone, Debug)]
pub struct PageChunks {
    address: u32,
    offset: usize,
    len: usize,
    page_size: usize,
}

impl PageChunks {
    /// Panics if `page_size` is zero.
    pub fn new(address: u32, len: usize, page_size: usize) -> Self {
        assert!(page_size > 0, "PageChunks: page_size must be nonzero");
        PageChunks { address, offset: 0, len, page_size }
    }
}

impl Iterator for PageChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.len {
            return None;
        }
        let address = self.address + self.offset as u32;
        let to_page_end = self.page_size - (address as usize % self.page_size);
        let size = usize::min(to_page_end, self.len - self.offset);
        let range = self.offset..self.offset + size;
        self.offset += size;
        Some(Chunk { address, range })
    }
}

/// Program `data` to `address` one page at a time.
///
/// For each chunk: set the write enable latch, send the page program, wait
/// for the chip to finish, then check the program fail bit. The first
/// failure stops the write, leaving earlier chunks programmed.
///
/// Calls `cb` with the number of bytes programmed so far, once before the
/// first chunk and after each one.
///
/// Does not check `address` against the chip capacity.
pub fn program_cb<L: Link, F: Fn(usize)>(
    transport: &mut Transport<L>, page_size: usize, address: u32, data: &[u8], cb: F,
) -> Result<()> {
    log::trace!("Programming {} bytes to 0x{:08X}, page size {} bytes",
                data.len(), address, page_size);
    let timeout = transport.timing().page_program;
    cb(0);
    for chunk in PageChunks::new(address, data.len(), page_size) {
        log::trace!("Page program 0x{:08X}, {} bytes", chunk.address, chunk.range.len());
        let len = chunk.range.len();
        let end = chunk.range.end;
        transport.write_enable()?;
        transport.execute(Operation::PageProgram { address: chunk.address, len },
                          Data::Transmit(&data[chunk.range]))?;
        Poller::ready().poll_until_ready(transport, timeout)?;
        if transport.read_security()?.get_program_fail() {
            log::error!("Page program at 0x{:08X} failed", chunk.address);
            return Err(Error::ProgramFailed(chunk.address));
        }
        cb(end);
    }
    Ok(())
}

#[cfg(test)]
fn chunks(address: u32, len: usize) -> Vec<(u32, usize)> {
    PageChunks::new(address, len, 256).map(|c| (c.address, c.range.len())).collect()
}

#[test]
fn test_chunks_aligned() {
    assert_eq!(chunks(0, 300), vec![(0, 256), (256, 44)]);
    assert_eq!(chunks(0x1000, 512), vec![(0x1000, 256), (0x1100, 256)]);
    assert!(chunks(0, 0).is_empty());
}

#[test]
fn test_chunks_one_byte_before_boundary() {
    // Starting one byte before a page boundary, two pages of data.
    assert_eq!(chunks(0x1FF, 512), vec![(0x1FF, 1), (0x200, 256), (0x300, 255)]);
    // Two pages' worth of span: first chunk to the boundary, second the remainder.
    assert_eq!(chunks(0x1FF, 257), vec![(0x1FF, 1), (0x200, 256)]);
}

#[test]
fn test_chunks_within_page() {
    assert_eq!(chunks(0x10, 16), vec![(0x10, 16)]);
    assert_eq!(chunks(0xF0, 16), vec![(0xF0, 16)]);
}

#[test]
fn test_chunks_never_cross_pages_and_cover_range() {
    for &page_size in &[1usize, 16, 256] {
        for address in (0u32..600).step_by(7) {
            for len in (0usize..1100).step_by(13) {
                let mut expected = 0;
                let mut count = 0;
                for chunk in PageChunks::new(address, len, page_size) {
                    let start = chunk.address as usize;
                    let end = start + chunk.range.len();
                    assert!(!chunk.range.is_empty());
                    assert_eq!(start / page_size, (end - 1) / page_size);
                    // Contiguous, no gaps or overlaps.
                    assert_eq!(chunk.range.start, expected);
                    assert_eq!(start, address as usize + expected);
                    expected = chunk.range.end;
                    count += 1;
                }
                assert_eq!(expected, len);
                let first = page_size - (address as usize % page_size);
                let pages = if len <= first { (len > 0) as usize }
                            else { 1 + (len - first + page_size - 1) / page_size };
                assert_eq!(count, pages);
            }
        }
    }
}
