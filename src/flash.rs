// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Block-device interface to the flash chip.

use std::fmt;
use std::time::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use crate::command::{Direction, Operation};
use crate::config::Config;
use crate::link::Link;
use crate::program;
use crate::status::{ChipStatus, Poller, StatusFlags};
use crate::sync::{self, DriverState, SignalFactory};
use crate::transport::{Data, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] anyhow::Error),
    #[error("Timed out waiting for {0} transfer to complete.")]
    TransferTimeout(Direction),
    #[error("Timed out after {timeout:?} waiting for status & 0x{mask:02X} == 0x{matches:02X}.")]
    StatusTimeout { mask: u8, matches: u8, timeout: Duration },
    #[error("Register readback did not match after {0}.")]
    Verification(ConfigStep),
    #[error("Initialisation failed during {step}.")]
    InitFailed { step: InitStep, #[source] source: Box<Error> },
    #[error("Operation not valid while chip is {0}.")]
    InvalidState(ChipStatus),
    #[error("Address 0x{address:08X} length {length} not supported by flash geometry.")]
    UnsupportedGeometry { address: usize, length: usize },
    #[error("Flash driver not initialised.")]
    NotInitialized,
    #[error("Page program at 0x{0:08X} failed.")]
    ProgramFailed(u32),
    #[error("Erase at 0x{0:08X} failed.")]
    EraseFailed(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn during(self, step: InitStep) -> Error {
        log::error!("Initialisation failed during {}: {}", step, self);
        Error::InitFailed { step, source: Box::new(self) }
    }
}

/// Chip state changes which are verified by reading back a register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigStep {
    QuadEnable,
    HighPerformance,
    Suspend,
    Resume,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigStep::QuadEnable => write!(f, "quad enable"),
            ConfigStep::HighPerformance => write!(f, "high performance enable"),
            ConfigStep::Suspend => write!(f, "suspend"),
            ConfigStep::Resume => write!(f, "resume"),
        }
    }
}

/// Steps of `NorFlash::init()`, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InitStep {
    Reset,
    QuadEnable,
    HighPerformance,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InitStep::Reset => write!(f, "reset"),
            InitStep::QuadEnable => write!(f, "quad enable"),
            InitStep::HighPerformance => write!(f, "high performance enable"),
        }
    }
}

/// Size information reported to the flash-translation layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Info {
    pub capacity: usize,
    pub block_size: usize,
    pub total_blocks: usize,
    pub sector_size: usize,
    pub total_sectors: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Capacity: {} bytes", self.capacity)?;
        writeln!(f, "Blocks: {} x {} bytes", self.total_blocks, self.block_size)?;
        writeln!(f, "Sectors: {} x {} bytes", self.total_sectors, self.sector_size)?;
        write!(f, "Pages: {} x {} bytes", self.total_pages, self.page_size)
    }
}

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

fn data_progress_bar(length: usize, msg: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(DATA_PROGRESS_TPL)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(DATA_PROGRESS_CHARS);
    let pb = ProgressBar::new(length as u64).with_style(style);
    pb.set_message(msg);
    pb
}

/// NOR flash block device.
///
/// Call `init()` before any read, write or erase. Status queries and
/// low-power control work without initialisation.
///
/// The driver holds no copy of flash contents and performs no internal
/// locking; callers must serialise access to one instance.
pub struct NorFlash<L: Link> {
    transport: Transport<L>,
    config: Config,
    signals: SignalFactory,
}

impl<L: Link> NorFlash<L> {
    /// Create a new driver for the chip attached to `link`.
    ///
    /// Returns an error if the geometry in `config` is invalid.
    pub fn new(link: L, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(NorFlash { transport: Transport::new(link, &config), config, signals: sync::semaphore })
    }

    /// Use `factory` to create the completion signals at `init()`,
    /// instead of the default [`sync::Semaphore`].
    pub fn with_signals(mut self, factory: SignalFactory) -> Self {
        self.signals = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self) -> &L {
        self.transport.link()
    }

    pub fn link_mut(&mut self) -> &mut L {
        self.transport.link_mut()
    }

    /// Deinitialise and return the link.
    pub fn release(self) -> L {
        self.transport.into_link()
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.is_attached()
    }

    /// Reset the chip, enable quad transfers and high-performance mode,
    /// then set up the completion signals.
    ///
    /// Each step is verified by reading back the chip's registers, and a
    /// failing step is reported as `InitFailed` naming that step. The
    /// driver stays uninitialised until `init()` succeeds.
    pub fn init(&mut self) -> Result<()> {
        log::debug!("Initialising flash, {} bytes", self.config.geometry.capacity);
        self.deinit();
        self.reset().map_err(|e| e.during(InitStep::Reset))?;
        self.enable_quad().map_err(|e| e.during(InitStep::QuadEnable))?;
        self.enable_high_performance().map_err(|e| e.during(InitStep::HighPerformance))?;
        self.transport.attach(DriverState::new(self.signals));
        log::debug!("Flash initialised");
        Ok(())
    }

    /// Drop the completion signals and detach them from the link.
    pub fn deinit(&mut self) {
        if self.transport.detach().is_some() {
            log::debug!("Flash deinitialised");
        }
    }

    pub fn get_info(&self) -> Info {
        let g = &self.config.geometry;
        Info {
            capacity: g.capacity,
            block_size: g.block_size,
            total_blocks: g.total_blocks(),
            sector_size: g.sector_size,
            total_sectors: g.total_sectors(),
            page_size: g.page_size,
            total_pages: g.total_pages(),
        }
    }

    /// Read `buf.len()` bytes starting at `address`.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.config.geometry.check_range(address, buf.len())?;
        self.ensure_initialized()?;
        if buf.is_empty() {
            return Ok(());
        }
        log::debug!("Reading {} bytes from 0x{:08X}", buf.len(), address);
        self.transport.execute(Operation::ReadArray { address, len: buf.len() },
                               Data::Receive(buf))
    }

    /// Read `buf.len()` bytes starting at `address`.
    ///
    /// This method is similar to `read()`, except it calls `cb` with the
    /// number of bytes read so far after each of up to 128 separate reads.
    pub fn read_cb<F: Fn(usize)>(&mut self, address: u32, buf: &mut [u8], cb: F) -> Result<()> {
        self.config.geometry.check_range(address, buf.len())?;
        self.ensure_initialized()?;
        let chunk_size = usize::max(1024, buf.len() / 128);
        let mut total = 0;
        cb(total);
        for chunk in buf.chunks_mut(chunk_size) {
            let len = chunk.len();
            self.transport.execute(Operation::ReadArray { address: address + total as u32, len },
                                   Data::Receive(chunk))?;
            total += len;
            cb(total);
        }
        Ok(())
    }

    /// Read `length` bytes starting at `address`, drawing a progress bar
    /// to the terminal.
    pub fn read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; length];
        let pb = data_progress_bar(length, "Reading");
        let result = self.read_cb(address, &mut data, |n| pb.set_position(n as u64));
        pb.finish();
        result.map(|_| data)
    }

    /// Program `data` starting at `address`.
    ///
    /// The region must already be erased. The write is split so that no
    /// page program crosses a page boundary; if any page fails, the
    /// remaining pages are not written.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_cb(address, data, |_| {})
    }

    /// Program `data` starting at `address`.
    ///
    /// Calls `cb` with the number of bytes programmed so far after each
    /// page program.
    pub fn write_cb<F: Fn(usize)>(&mut self, address: u32, data: &[u8], cb: F) -> Result<()> {
        self.config.geometry.check_range(address, data.len())?;
        self.ensure_initialized()?;
        if data.is_empty() {
            return Ok(());
        }
        log::debug!("Writing {} bytes to 0x{:08X}", data.len(), address);
        program::program_cb(&mut self.transport, self.config.geometry.page_size, address, data, cb)
    }

    /// Program `data` starting at `address`, drawing a progress bar to the terminal.
    pub fn write_progress(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let pb = data_progress_bar(data.len(), "Writing");
        let result = self.write_cb(address, data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Erase block `index`.
    pub fn erase_block(&mut self, index: usize) -> Result<()> {
        let address = self.config.geometry.block_address(index)?;
        self.ensure_initialized()?;
        log::debug!("Erasing block {} at 0x{:08X}", index, address);
        self.erase(Operation::BlockErase { address }, address, self.config.timing.block_erase)
    }

    /// Erase sector `index`.
    pub fn erase_sector(&mut self, index: usize) -> Result<()> {
        let address = self.config.geometry.sector_address(index)?;
        self.ensure_initialized()?;
        log::debug!("Erasing sector {} at 0x{:08X}", index, address);
        self.erase(Operation::SectorErase { address }, address, self.config.timing.sector_erase)
    }

    /// Erase the entire chip.
    ///
    /// Returns only after the erase completes, which may take minutes.
    pub fn erase_chip(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        log::debug!("Erasing entire chip");
        self.erase(Operation::ChipErase, 0, self.config.timing.chip_erase)
    }

    /// Erase the entire chip, drawing a spinner to the terminal.
    pub fn erase_chip_progress(&mut self) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        pb.enable_steady_tick(Duration::from_millis(100));
        let result = self.erase_chip();
        pb.finish();
        result
    }

    /// Check whether every byte of block `index` reads as 0xFF.
    pub fn is_block_erased(&mut self, index: usize) -> Result<bool> {
        let address = self.config.geometry.block_address(index)?;
        let mut data = vec![0u8; self.config.geometry.block_size];
        self.read(address, &mut data)?;
        Ok(data.iter().all(|b| *b == 0xFF))
    }

    /// Read the status and security registers.
    pub fn read_flags(&mut self) -> Result<StatusFlags> {
        self.transport.read_flags()
    }

    /// Report whether the chip is ready, busy, suspended, or has failed
    /// its last program or erase.
    pub fn get_status(&mut self) -> Result<ChipStatus> {
        let flags = self.read_flags()?;
        let status = flags.chip_status();
        log::debug!("Chip is {} ({:?})", status, flags);
        Ok(status)
    }

    /// Suspend an erase or program in progress.
    ///
    /// Does nothing and returns success if the chip is not busy.
    pub fn suspend_erase(&mut self) -> Result<()> {
        match self.require_status(ChipStatus::Busy) {
            Err(Error::InvalidState(status)) => {
                log::warn!("Not suspending, chip is {}", status);
                return Ok(());
            },
            result => result?,
        }
        log::debug!("Suspending erase");
        self.transport.command(Operation::Suspend)?;
        self.verify_status(ChipStatus::Suspended, ConfigStep::Suspend)
    }

    /// Resume a suspended erase or program.
    ///
    /// Does nothing and returns success if the chip is not suspended.
    pub fn resume_erase(&mut self) -> Result<()> {
        match self.require_status(ChipStatus::Suspended) {
            Err(Error::InvalidState(status)) => {
                log::warn!("Not resuming, chip is {}", status);
                return Ok(());
            },
            result => result?,
        }
        log::debug!("Resuming erase");
        self.transport.command(Operation::Resume)?;
        self.verify_status(ChipStatus::Busy, ConfigStep::Resume)
    }

    /// Put the chip into deep power-down.
    pub fn enter_low_power(&mut self) -> Result<()> {
        log::debug!("Entering deep power-down");
        self.transport.command(Operation::EnterDeepPowerDown)
    }

    /// Wake the chip from deep power-down.
    pub fn leave_low_power(&mut self) -> Result<()> {
        log::debug!("Leaving deep power-down");
        self.transport.command(Operation::LeaveDeepPowerDown)
    }

    /// Switch the link to memory-mapped mode, using the configured
    /// array read and page program commands.
    pub fn enable_memory_mapped(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let encoder = self.transport.encoder();
        let read = encoder.encode(Operation::MemoryMappedRead);
        let write = encoder.encode(Operation::MemoryMappedWrite);
        log::debug!("Enabling memory-mapped mode, read 0x{:02X} write 0x{:02X}",
                    read.instruction(), write.instruction());
        self.transport.link_mut().enable_memory_mapped(&read, &write)?;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.transport.is_attached() {
            Ok(())
        } else {
            log::error!("Flash used before init()");
            Err(Error::NotInitialized)
        }
    }

    fn require_status(&mut self, expected: ChipStatus) -> Result<()> {
        match self.get_status()? {
            status if status == expected => Ok(()),
            status => Err(Error::InvalidState(status)),
        }
    }

    fn verify_status(&mut self, expected: ChipStatus, step: ConfigStep) -> Result<()> {
        let status = self.get_status()?;
        if status == expected {
            Ok(())
        } else {
            log::error!("Chip is {} after {}, expected {}", status, step, expected);
            Err(Error::Verification(step))
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        Poller::ready().poll_until_ready(&mut self.transport, timeout)?;
        Ok(())
    }

    fn erase(&mut self, op: Operation, address: u32, timeout: Duration) -> Result<()> {
        self.transport.write_enable()?;
        self.transport.command(op)?;
        self.wait_ready(timeout)?;
        if self.transport.read_security()?.get_erase_fail() {
            log::error!("Erase at 0x{:08X} failed", address);
            return Err(Error::EraseFailed(address));
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting flash");
        self.transport.command(Operation::EnableReset)?;
        self.transport.command(Operation::Reset)?;
        self.wait_ready(self.config.timing.command)
    }

    fn enable_quad(&mut self) -> Result<()> {
        let status = self.transport.set_quad_enable()?;
        if status.get_qe() {
            Ok(())
        } else {
            log::error!("QE bit not set after write, status register 0x{:02X}", status.0);
            Err(Error::Verification(ConfigStep::QuadEnable))
        }
    }

    fn enable_high_performance(&mut self) -> Result<()> {
        let config = self.transport.set_high_performance()?;
        if config.get_high_performance() {
            Ok(())
        } else {
            log::error!("L/H switch not set after write, configuration {:02X?}", config.0);
            Err(Error::Verification(ConfigStep::HighPerformance))
        }
    }
}

#[cfg(test)]
use crate::sim::{BusyOp, SimChip, SimLink};
#[cfg(test)]
use crate::command::Opcode;
#[cfg(test)]
use std::time::Instant;

#[cfg(test)]
fn uninit_flash(config: Config) -> NorFlash<SimLink> {
    NorFlash::new(SimLink::new(SimChip::new(config.geometry)), config).unwrap()
}

#[cfg(test)]
fn test_flash_with(config: Config) -> NorFlash<SimLink> {
    let mut flash = uninit_flash(config);
    flash.init().unwrap();
    flash.link_mut().chip_mut().clear_commands();
    flash
}

#[cfg(test)]
fn test_flash() -> NorFlash<SimLink> {
    test_flash_with(Config::mx25r6435f())
}

#[cfg(test)]
fn program_lengths(flash: &NorFlash<SimLink>) -> Vec<usize> {
    flash.link().chip().commands().iter()
        .filter(|cmd| cmd.opcode == Opcode::QuadPageProgram)
        .map(|cmd| cmd.data_len())
        .collect()
}

#[test]
fn test_init() {
    let mut flash = uninit_flash(Config::mx25r6435f());
    assert!(!flash.is_initialized());
    flash.init().unwrap();
    assert!(flash.is_initialized());
    assert!(flash.link().is_attached());
    let chip = flash.link().chip();
    assert_eq!(&chip.opcodes()[..2], &[Opcode::EnableReset, Opcode::Reset]);
    assert!(chip.status_register().get_qe());
    assert!(chip.config_register().get_high_performance());
    let writes = chip.opcodes().iter().filter(|op| **op == Opcode::WriteStatusConfigRegister).count();
    assert_eq!(writes, 2);
}

#[test]
fn test_init_reset_failure() {
    let mut flash = uninit_flash(Config::mx25r6435f());
    flash.link_mut().chip_mut().faults.reject_opcode = Some(Opcode::EnableReset);
    match flash.init() {
        Err(Error::InitFailed { step: InitStep::Reset, source }) =>
            assert!(matches!(*source, Error::Link(_))),
        result => panic!("unexpected result {:?}", result),
    }
    assert!(!flash.is_initialized());
}

#[test]
fn test_init_quad_enable_verification() {
    let mut flash = uninit_flash(Config::mx25r6435f());
    flash.link_mut().chip_mut().faults.ignore_register_writes = true;
    match flash.init() {
        Err(Error::InitFailed { step: InitStep::QuadEnable, source }) =>
            assert!(matches!(*source, Error::Verification(ConfigStep::QuadEnable))),
        result => panic!("unexpected result {:?}", result),
    }
    let mut buf = [0u8; 4];
    assert!(matches!(flash.read(0, &mut buf), Err(Error::NotInitialized)));
}

#[test]
fn test_init_high_performance_verification() {
    let mut flash = uninit_flash(Config::mx25r6435f());
    // QE already set, so only the configuration register write is lost.
    flash.link_mut().chip_mut().set_status_register(0x40);
    flash.link_mut().chip_mut().faults.ignore_register_writes = true;
    match flash.init() {
        Err(Error::InitFailed { step: InitStep::HighPerformance, source }) =>
            assert!(matches!(*source, Error::Verification(ConfigStep::HighPerformance))),
        result => panic!("unexpected result {:?}", result),
    }
    assert!(!flash.is_initialized());
}

#[test]
fn test_erase_write_read_scenario() {
    let mut flash = test_flash();
    let data: Vec<u8> = (0..300).map(|i| (i * 7 + 3) as u8).collect();
    flash.erase_block(0).unwrap();
    flash.write(0, &data).unwrap();
    let mut readback = vec![0u8; 300];
    flash.read(0, &mut readback).unwrap();
    assert_eq!(readback, data);
    assert_eq!(program_lengths(&flash), vec![256, 44]);
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Ready);
}

#[test]
fn test_write_one_byte_before_page_boundary() {
    let mut flash = test_flash();
    let data = vec![0x5A; 256];
    flash.write(0x1FF, &data).unwrap();
    assert_eq!(program_lengths(&flash), vec![1, 255]);
    let commands = flash.link().chip().commands().iter()
        .filter(|cmd| cmd.opcode == Opcode::QuadPageProgram)
        .map(|cmd| cmd.address.map(|a| a.value))
        .collect::<Vec<_>>();
    assert_eq!(commands, vec![Some(0x1FF), Some(0x200)]);
    let mut readback = vec![0u8; 258];
    flash.read(0x1FE, &mut readback).unwrap();
    assert_eq!(readback[0], 0xFF);
    assert!(readback[1..257].iter().all(|b| *b == 0x5A));
    assert_eq!(readback[257], 0xFF);
}

#[test]
fn test_write_sets_write_enable_per_page() {
    let mut flash = test_flash();
    flash.write(0x80, &[0u8; 600]).unwrap();
    let opcodes = flash.link().chip().opcodes();
    let wren = opcodes.iter().filter(|op| **op == Opcode::WriteEnable).count();
    assert_eq!(wren, program_lengths(&flash).len());
    assert_eq!(program_lengths(&flash), vec![128, 256, 216]);
}

#[test]
fn test_write_aborts_on_failure() {
    let mut flash = test_flash();
    flash.link_mut().chip_mut().faults.reject_opcode = Some(Opcode::QuadPageProgram);
    let result = flash.write(0, &[0u8; 600]);
    assert!(matches!(result, Err(Error::Link(_))));
    // Only the first chunk was attempted.
    let opcodes = flash.link().chip().opcodes();
    assert_eq!(opcodes.iter().filter(|op| **op == Opcode::WriteEnable).count(), 1);
    assert!(flash.link().chip().image()[..600].iter().all(|b| *b == 0xFF));
}

#[test]
fn test_resume_when_ready_is_noop() {
    let mut flash = test_flash();
    flash.resume_erase().unwrap();
    // Only the state check reached the chip.
    let opcodes = flash.link().chip().opcodes();
    assert!(opcodes.iter().all(|op| *op == Opcode::ReadSecurityRegister
                                     || *op == Opcode::ReadStatusRegister));
    assert!(!opcodes.contains(&Opcode::Resume));
}

#[test]
fn test_suspend_when_ready_is_noop() {
    let mut flash = test_flash();
    flash.suspend_erase().unwrap();
    assert!(!flash.link().chip().opcodes().contains(&Opcode::Suspend));
}

#[test]
fn test_suspend_and_resume_erase() {
    let mut flash = test_flash();
    flash.link_mut().chip_mut().hold_busy(BusyOp::Erase, 100);
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Busy);
    flash.suspend_erase().unwrap();
    assert!(flash.link().chip().is_suspended());
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Suspended);
    flash.resume_erase().unwrap();
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Busy);
}

#[test]
fn test_suspend_verification_failure() {
    let mut flash = test_flash();
    // Register writes cannot be suspended, so the chip stays busy.
    flash.link_mut().chip_mut().hold_busy(BusyOp::Register, 100);
    assert!(matches!(flash.suspend_erase(), Err(Error::Verification(ConfigStep::Suspend))));
}

#[test]
fn test_get_status_idempotent() {
    let mut flash = test_flash();
    let first = flash.get_status().unwrap();
    let second = flash.get_status().unwrap();
    assert_eq!(first, ChipStatus::Ready);
    assert_eq!(first, second);
}

#[test]
fn test_erase_failure_status() {
    let mut flash = test_flash();
    flash.link_mut().chip_mut().faults.erase_fail = true;
    assert!(matches!(flash.erase_sector(1), Err(Error::EraseFailed(0x1000))));
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Failed);
    assert!(matches!(flash.erase_chip(), Err(Error::EraseFailed(0))));
    flash.link_mut().chip_mut().faults.erase_fail = false;
    flash.erase_sector(0).unwrap();
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Ready);
}

#[test]
fn test_write_program_failure() {
    let mut flash = test_flash();
    flash.link_mut().chip_mut().faults.program_fail = true;
    assert!(matches!(flash.write(0x1F0, &[0u8; 64]), Err(Error::ProgramFailed(0x1F0))));
    // The write stops after the first failing page.
    assert_eq!(program_lengths(&flash), vec![16]);
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Failed);

    flash.link_mut().chip_mut().faults.program_fail = false;
    flash.write(0x1F0, &[0u8; 64]).unwrap();
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Ready);
}

#[test]
fn test_transfer_timeout() {
    let mut config = Config::mx25r6435f();
    config.timing.transfer = Duration::from_millis(20);
    let mut flash = test_flash_with(config);
    flash.link_mut().chip_mut().faults.drop_completions = true;
    let mut buf = [0u8; 16];
    let t0 = Instant::now();
    let result = flash.read(0, &mut buf);
    assert!(matches!(result, Err(Error::TransferTimeout(Direction::Receive))));
    assert!(t0.elapsed() < Duration::from_secs(5));
    // The driver recovers once completions arrive again.
    flash.link_mut().chip_mut().faults.drop_completions = false;
    flash.read(0, &mut buf).unwrap();
}

#[test]
fn test_late_completion_does_not_satisfy_next_read() {
    let mut config = Config::mx25r6435f();
    config.timing.transfer = Duration::from_millis(20);
    let mut flash = test_flash_with(config);
    flash.link_mut().chip_mut().faults.completion_delay = Some(Duration::from_millis(60));
    let mut buf = [0u8; 16];
    assert!(matches!(flash.read(0, &mut buf), Err(Error::TransferTimeout(Direction::Receive))));

    std::thread::sleep(Duration::from_millis(100));
    flash.link_mut().chip_mut().faults.completion_delay = None;
    flash.link_mut().chip_mut().faults.drop_completions = true;
    assert!(matches!(flash.read(0, &mut buf), Err(Error::TransferTimeout(Direction::Receive))));
}

#[test]
fn test_delayed_completion() {
    let mut flash = test_flash();
    flash.link_mut().chip_mut().faults.completion_delay = Some(Duration::from_millis(5));
    flash.write(0x10, &[1, 2, 3]).unwrap();
    let mut buf = [0u8; 3];
    flash.read(0x10, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3]);
}

#[test]
fn test_erase_timeouts_per_class() {
    let mut config = Config::mx25r6435f();
    config.timing.block_erase = Duration::from_millis(10);
    config.timing.chip_erase = Duration::from_millis(30);
    let mut flash = test_flash_with(config);
    flash.link_mut().chip_mut().faults.stuck_busy = true;
    match flash.erase_block(1) {
        Err(Error::StatusTimeout { timeout, .. }) => assert_eq!(timeout, Duration::from_millis(10)),
        result => panic!("unexpected result {:?}", result),
    }
    match flash.erase_chip() {
        Err(Error::StatusTimeout { timeout, .. }) => assert_eq!(timeout, Duration::from_millis(30)),
        result => panic!("unexpected result {:?}", result),
    }
}

#[test]
fn test_out_of_range() {
    let mut flash = test_flash();
    let capacity = flash.get_info().capacity as u32;
    let mut buf = [0u8; 2];
    assert!(matches!(flash.read(capacity - 1, &mut buf),
                     Err(Error::UnsupportedGeometry { .. })));
    assert!(matches!(flash.write(capacity, &[0]), Err(Error::UnsupportedGeometry { .. })));
    assert!(matches!(flash.erase_block(128), Err(Error::UnsupportedGeometry { .. })));
    assert!(matches!(flash.erase_sector(2048), Err(Error::UnsupportedGeometry { .. })));
    assert!(flash.link().chip().commands().is_empty());
}

#[test]
fn test_new_rejects_capacity_above_16mib() {
    let mut config = Config::mx25r6435f();
    let link = SimLink::new(SimChip::new(config.geometry));
    config.geometry.capacity = 32 * 1024 * 1024;
    assert!(matches!(NorFlash::new(link, config), Err(Error::UnsupportedGeometry { .. })));
}

#[test]
fn test_not_initialized() {
    let mut flash = uninit_flash(Config::mx25r6435f());
    assert!(matches!(flash.erase_block(0), Err(Error::NotInitialized)));
    assert!(matches!(flash.write(0, &[0]), Err(Error::NotInitialized)));
    assert!(matches!(flash.enable_memory_mapped(), Err(Error::NotInitialized)));
    // Status works without init.
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Ready);
}

#[test]
fn test_deinit() {
    let mut flash = test_flash();
    flash.deinit();
    assert!(!flash.is_initialized());
    assert!(!flash.link().is_attached());
    let mut buf = [0u8; 1];
    assert!(matches!(flash.read(0, &mut buf), Err(Error::NotInitialized)));
    flash.init().unwrap();
    flash.read(0, &mut buf).unwrap();
}

#[test]
fn test_low_power() {
    let mut flash = test_flash();
    flash.enter_low_power().unwrap();
    assert!(flash.link().chip().is_powered_down());
    flash.leave_low_power().unwrap();
    assert!(!flash.link().chip().is_powered_down());
    assert_eq!(flash.get_status().unwrap(), ChipStatus::Ready);
}

#[test]
fn test_is_block_erased() {
    let mut flash = test_flash();
    assert!(flash.is_block_erased(1).unwrap());
    flash.write(0x1FFFF, &[0x00]).unwrap();
    assert!(!flash.is_block_erased(1).unwrap());
    assert!(flash.is_block_erased(2).unwrap());
    flash.erase_block(1).unwrap();
    assert!(flash.is_block_erased(1).unwrap());
}

#[test]
fn test_erase_chip() {
    let mut flash = test_flash();
    flash.write(0x12345, &[0u8; 100]).unwrap();
    flash.erase_chip().unwrap();
    assert!(flash.link().chip().image().iter().all(|b| *b == 0xFF));
}

#[test]
fn test_read_cb_progress() {
    let mut flash = test_flash();
    let positions = std::cell::RefCell::new(Vec::new());
    let mut buf = vec![0u8; 3000];
    flash.read_cb(0, &mut buf, |n| positions.borrow_mut().push(n)).unwrap();
    assert_eq!(positions.into_inner(), vec![0, 1024, 2048, 3000]);
}

#[test]
fn test_memory_mapped() {
    let mut flash = test_flash();
    flash.enable_memory_mapped().unwrap();
    let (read, write) = flash.link().memory_mapped().unwrap();
    assert_eq!(read.opcode, Opcode::QuadRead);
    assert_eq!(write.opcode, Opcode::QuadPageProgram);
}

#[test]
fn test_get_info() {
    let info = test_flash().get_info();
    assert_eq!(info.capacity, 8 * 1024 * 1024);
    assert_eq!(info.block_size, 65536);
    assert_eq!(info.total_blocks, 128);
    assert_eq!(info.total_sectors, 2048);
    assert_eq!(info.total_pages, 32768);
}
