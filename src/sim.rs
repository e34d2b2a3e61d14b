// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! A simulated MX25R6435F behind the [`Link`] trait.
//!
//! The simulation keeps the whole array in memory and models the parts of
//! the chip the driver relies on: the write enable latch, page programs
//! which wrap within their page and can only clear bits, erase fill, busy
//! time measured in status register reads, erase/program suspend, and deep
//! power-down. Faults can be injected to exercise error paths, and every
//! command received is logged for inspection.

use std::thread;
use std::time::Duration;
use crate::command::{Command, Direction, Opcode, TransferKind};
use crate::geometry::Geometry;
use crate::link::Link;
use crate::status::{ConfigRegister, SecurityRegister, StatusRegister};
use crate::sync::CompletionCallbacks;

/// Kind of internal operation keeping the chip busy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusyOp {
    Program,
    Erase,
    Register,
}

#[derive(Copy, Clone, Debug)]
struct Busy {
    op: BusyOp,
    remaining: usize,
}

/// Number of status register reads for which each operation reports busy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusyReads {
    pub register_write: usize,
    pub page_program: usize,
    pub sector_erase: usize,
    pub block_erase: usize,
    pub chip_erase: usize,
}

impl Default for BusyReads {
    fn default() -> Self {
        BusyReads {
            register_write: 1, page_program: 2, sector_erase: 3, block_erase: 5, chip_erase: 8,
        }
    }
}

/// Faults to inject.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Fail `send_command()` for this opcode.
    pub reject_opcode: Option<Opcode>,
    /// Never invoke the completion callbacks.
    pub drop_completions: bool,
    /// Invoke completion callbacks from another thread after this delay.
    pub completion_delay: Option<Duration>,
    /// Report WIP set on every status read.
    pub stuck_busy: bool,
    /// Accept but discard status/configuration register writes.
    pub ignore_register_writes: bool,
    /// Set P_FAIL instead of programming.
    pub program_fail: bool,
    /// Set E_FAIL instead of erasing.
    pub erase_fail: bool,
}

#[derive(Copy, Clone, Debug)]
struct Pending {
    cmd: Command,
    /// Command arrived while in deep power-down, so only woke the chip.
    ignored: bool,
}

pub struct SimChip {
    geometry: Geometry,
    memory: Vec<u8>,
    /// Non-volatile status register bits; WIP and WEL are derived.
    status: u8,
    config: [u8; 2],
    /// Fail bits; suspend bits are derived.
    security: u8,
    wel: bool,
    busy: Option<Busy>,
    suspended: Option<Busy>,
    reset_enabled: bool,
    powered_down: bool,
    pending: Option<Pending>,
    log: Vec<Command>,
    pub busy_reads: BusyReads,
    pub faults: Faults,
}

impl SimChip {
    /// A blank (all 0xFF) chip.
    pub fn new(geometry: Geometry) -> Self {
        SimChip {
            geometry,
            memory: vec![0xFF; geometry.capacity],
            status: 0,
            config: [0; 2],
            security: 0,
            wel: false,
            busy: None,
            suspended: None,
            reset_enabled: false,
            powered_down: false,
            pending: None,
            log: Vec::new(),
            busy_reads: BusyReads::default(),
            faults: Faults::default(),
        }
    }

    /// A chip whose array starts with `image`, the remainder blank.
    pub fn from_image(geometry: Geometry, image: &[u8]) -> anyhow::Result<Self> {
        if image.len() > geometry.capacity {
            anyhow::bail!("Image of {} bytes is larger than flash capacity {}",
                          image.len(), geometry.capacity);
        }
        let mut chip = SimChip::new(geometry);
        chip.memory[..image.len()].copy_from_slice(image);
        Ok(chip)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Entire array contents.
    pub fn image(&self) -> &[u8] {
        &self.memory
    }

    /// Every command received since creation or the last `clear_commands()`.
    pub fn commands(&self) -> &[Command] {
        &self.log
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.log.iter().map(|cmd| cmd.opcode).collect()
    }

    pub fn clear_commands(&mut self) {
        self.log.clear();
    }

    /// Status register as the next read would return it, without
    /// advancing any busy operation.
    pub fn status_register(&self) -> StatusRegister {
        let mut sr = self.status;
        if self.wel {
            sr |= StatusRegister::WEL;
        }
        if self.busy.is_some() || self.faults.stuck_busy {
            sr |= StatusRegister::WIP;
        }
        StatusRegister(sr)
    }

    /// Set the non-volatile status register bits.
    pub fn set_status_register(&mut self, sr: u8) {
        self.status = sr & !(StatusRegister::WIP | StatusRegister::WEL);
    }

    pub fn security_register(&self) -> SecurityRegister {
        let mut secr = self.security;
        match self.suspended.map(|s| s.op) {
            Some(BusyOp::Program) => secr |= SecurityRegister::PSB,
            Some(BusyOp::Erase) => secr |= SecurityRegister::ESB,
            _ => (),
        }
        SecurityRegister(secr)
    }

    pub fn config_register(&self) -> ConfigRegister {
        ConfigRegister(self.config)
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// Make the chip busy with `op` for the next `reads` status reads.
    pub fn hold_busy(&mut self, op: BusyOp, reads: usize) {
        self.busy = if reads > 0 { Some(Busy { op, remaining: reads }) } else { None };
    }

    fn command(&mut self, cmd: &Command) -> anyhow::Result<()> {
        if self.faults.reject_opcode == Some(cmd.opcode) {
            anyhow::bail!("Command 0x{:02X} rejected", cmd.instruction());
        }
        self.log.push(*cmd);

        if self.powered_down {
            log::trace!("sim: 0x{:02X} wakes chip from deep power-down", cmd.instruction());
            self.powered_down = false;
            self.reset_enabled = false;
            self.pending = cmd.data.map(|_| Pending { cmd: *cmd, ignored: true });
            return Ok(());
        }

        let reset_enabled = std::mem::replace(&mut self.reset_enabled, false);
        if cmd.data.is_some() {
            self.pending = Some(Pending { cmd: *cmd, ignored: false });
            return Ok(());
        }
        self.pending = None;

        let address = cmd.address.map(|a| a.value).unwrap_or(0);
        match cmd.opcode {
            Opcode::WriteEnable => self.wel = true,
            Opcode::EnableReset => self.reset_enabled = true,
            Opcode::Reset if reset_enabled => self.reset(),
            Opcode::Reset => log::trace!("sim: reset without reset enable ignored"),
            Opcode::SectorErase =>
                self.erase(address, self.geometry.sector_size, self.busy_reads.sector_erase),
            Opcode::BlockErase =>
                self.erase(address, self.geometry.block_size, self.busy_reads.block_erase),
            Opcode::ChipErase =>
                self.erase(0, self.geometry.capacity, self.busy_reads.chip_erase),
            Opcode::Suspend => self.suspend(),
            Opcode::Resume => self.resume(),
            Opcode::DeepPowerDown => if self.busy.is_none() {
                self.powered_down = true;
            },
            Opcode::Nop => (),
            opcode => anyhow::bail!("Command {:?} requires a data phase", opcode),
        }
        Ok(())
    }

    fn take_pending(&mut self, direction: Direction, kind: TransferKind, len: usize)
        -> anyhow::Result<Pending>
    {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => anyhow::bail!("Data phase without a command"),
        };
        match pending.cmd.data {
            Some(phase) if phase.direction == direction && phase.kind == kind && phase.len == len
                => Ok(pending),
            phase => anyhow::bail!("Data phase {:?} {:?} of {} bytes does not match {:?}",
                                   direction, kind, len, phase),
        }
    }

    fn receive(&mut self, buf: &mut [u8], kind: TransferKind) -> anyhow::Result<()> {
        let pending = self.take_pending(Direction::Receive, kind, buf.len())?;
        if pending.ignored {
            buf.iter_mut().for_each(|b| *b = 0xFF);
            return Ok(());
        }
        let cmd = pending.cmd;
        match cmd.opcode {
            Opcode::ReadStatusRegister => {
                buf[0] = self.status_register().0;
                self.tick();
            },
            Opcode::ReadSecurityRegister => buf[0] = self.security_register().0,
            Opcode::ReadConfigRegister => buf.copy_from_slice(&self.config[..buf.len()]),
            Opcode::FastRead | Opcode::DualRead | Opcode::QuadRead => {
                let start = cmd.address.map(|a| a.value).unwrap_or(0) as usize;
                match self.memory.get(start..start + buf.len()) {
                    Some(data) => buf.copy_from_slice(data),
                    None => anyhow::bail!("Read of {} bytes at 0x{:08X} out of range",
                                          buf.len(), start),
                }
            },
            opcode => anyhow::bail!("Command {:?} does not receive data", opcode),
        }
        Ok(())
    }

    fn transmit(&mut self, data: &[u8], kind: TransferKind) -> anyhow::Result<()> {
        let pending = self.take_pending(Direction::Transmit, kind, data.len())?;
        if pending.ignored {
            return Ok(());
        }
        let cmd = pending.cmd;
        match cmd.opcode {
            Opcode::WriteStatusConfigRegister => self.write_registers(data),
            Opcode::PageProgram | Opcode::QuadPageProgram =>
                self.program(cmd.address.map(|a| a.value).unwrap_or(0), data),
            opcode => anyhow::bail!("Command {:?} does not transmit data", opcode),
        }
        Ok(())
    }

    /// A status read has completed; advance the busy operation.
    fn tick(&mut self) {
        self.busy = self.busy.and_then(|busy| match busy.remaining {
            0 | 1 => None,
            n => Some(Busy { remaining: n - 1, ..busy }),
        });
    }

    /// Program and erase need WEL set and the chip idle, and clear WEL.
    fn accept_write(&mut self) -> bool {
        let accepted = self.wel && self.busy.is_none();
        if !accepted {
            log::trace!("sim: write ignored, WEL={} busy={}", self.wel, self.busy.is_some());
        }
        self.wel = false;
        accepted
    }

    fn write_registers(&mut self, data: &[u8]) {
        if !self.accept_write() {
            return;
        }
        if !self.faults.ignore_register_writes {
            self.set_status_register(data[0]);
            for (reg, byte) in self.config.iter_mut().zip(&data[1..]) {
                *reg = *byte;
            }
        }
        self.hold_busy(BusyOp::Register, self.busy_reads.register_write);
    }

    fn program(&mut self, address: u32, data: &[u8]) {
        if !self.accept_write() {
            return;
        }
        let page_size = self.geometry.page_size;
        let base = address as usize - address as usize % page_size;
        let offset = address as usize % page_size;
        if self.faults.program_fail || base >= self.memory.len() {
            self.security |= SecurityRegister::P_FAIL;
        } else {
            self.security &= !SecurityRegister::P_FAIL;
            for (i, byte) in data.iter().enumerate() {
                self.memory[base + (offset + i) % page_size] &= byte;
            }
        }
        self.hold_busy(BusyOp::Program, self.busy_reads.page_program);
    }

    fn erase(&mut self, address: u32, size: usize, reads: usize) {
        if !self.accept_write() {
            return;
        }
        let base = address as usize - address as usize % size;
        if self.faults.erase_fail || base >= self.memory.len() {
            self.security |= SecurityRegister::E_FAIL;
        } else {
            self.security &= !SecurityRegister::E_FAIL;
            let end = usize::min(base + size, self.memory.len());
            self.memory[base..end].iter_mut().for_each(|b| *b = 0xFF);
        }
        self.hold_busy(BusyOp::Erase, reads);
    }

    fn suspend(&mut self) {
        match self.busy {
            Some(busy) if busy.op != BusyOp::Register => {
                self.suspended = Some(busy);
                self.busy = None;
            },
            _ => log::trace!("sim: suspend ignored"),
        }
    }

    fn resume(&mut self) {
        if let Some(suspended) = self.suspended.take() {
            self.busy = Some(suspended);
        }
    }

    fn reset(&mut self) {
        self.wel = false;
        self.busy = None;
        self.suspended = None;
    }
}

/// [`Link`] provider connected to a [`SimChip`].
///
/// Asynchronous transfers move their data immediately, then invoke the
/// completion callback either before returning or, with a
/// `completion_delay` fault, from a separate thread.
pub struct SimLink {
    chip: SimChip,
    callbacks: Option<CompletionCallbacks>,
    memory_mapped: Option<(Command, Command)>,
}

impl SimLink {
    pub fn new(chip: SimChip) -> Self {
        SimLink { chip, callbacks: None, memory_mapped: None }
    }

    pub fn chip(&self) -> &SimChip {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut SimChip {
        &mut self.chip
    }

    pub fn into_chip(self) -> SimChip {
        self.chip
    }

    pub fn is_attached(&self) -> bool {
        self.callbacks.is_some()
    }

    /// Read and write templates, once memory-mapped mode is enabled.
    pub fn memory_mapped(&self) -> Option<&(Command, Command)> {
        self.memory_mapped.as_ref()
    }

    fn callbacks(&self) -> anyhow::Result<CompletionCallbacks> {
        match &self.callbacks {
            Some(callbacks) => Ok(callbacks.clone()),
            None => anyhow::bail!("No completion callbacks attached"),
        }
    }

    fn complete(&self, callbacks: CompletionCallbacks, direction: Direction) {
        if self.chip.faults.drop_completions {
            log::trace!("sim: dropping {} completion", direction);
            return;
        }
        let notify = move || match direction {
            Direction::Receive => callbacks.on_receive_complete(),
            Direction::Transmit => callbacks.on_transmit_complete(),
        };
        match self.chip.faults.completion_delay {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    notify();
                });
            },
            None => notify(),
        }
    }
}

impl Link for SimLink {
    fn send_command(&mut self, cmd: &Command, _timeout: Duration) -> anyhow::Result<()> {
        self.chip.command(cmd)
    }

    fn transmit_blocking(&mut self, data: &[u8], _timeout: Duration) -> anyhow::Result<()> {
        self.chip.transmit(data, TransferKind::Blocking)
    }

    fn receive_blocking(&mut self, buf: &mut [u8], _timeout: Duration) -> anyhow::Result<()> {
        self.chip.receive(buf, TransferKind::Blocking)
    }

    fn transmit_async(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let callbacks = self.callbacks()?;
        self.chip.transmit(data, TransferKind::Interrupt)?;
        self.complete(callbacks, Direction::Transmit);
        Ok(())
    }

    fn receive_async(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let callbacks = self.callbacks()?;
        self.chip.receive(buf, TransferKind::Interrupt)?;
        self.complete(callbacks, Direction::Receive);
        Ok(())
    }

    fn attach(&mut self, callbacks: CompletionCallbacks) {
        self.callbacks = Some(callbacks);
    }

    fn detach(&mut self) {
        self.callbacks = None;
    }

    fn enable_memory_mapped(&mut self, read: &Command, write: &Command) -> anyhow::Result<()> {
        for cmd in &[read, write] {
            if cmd.data.map(|d| d.kind) != Some(TransferKind::MemoryMapped) {
                anyhow::bail!("Command 0x{:02X} is not a memory-mapped template",
                              cmd.instruction());
            }
        }
        self.memory_mapped = Some((*read, *write));
        Ok(())
    }
}

#[cfg(test)]
use crate::command::{Encoder, Operation};
#[cfg(test)]
use crate::config::Config;

#[cfg(test)]
fn encode(op: Operation) -> Command {
    Encoder::new(&Config::mx25r6435f()).encode(op)
}

#[cfg(test)]
fn blank_chip() -> SimChip {
    let mut chip = SimChip::new(crate::geometry::MX25R6435F);
    chip.busy_reads = BusyReads {
        register_write: 0, page_program: 0, sector_erase: 0, block_erase: 0, chip_erase: 0,
    };
    chip
}

#[cfg(test)]
fn program(chip: &mut SimChip, address: u32, data: &[u8]) {
    chip.command(&encode(Operation::WriteEnable)).unwrap();
    chip.command(&encode(Operation::PageProgram { address, len: data.len() })).unwrap();
    chip.transmit(data, TransferKind::Interrupt).unwrap();
}

#[test]
fn test_program_wraps_within_page() {
    let mut chip = blank_chip();
    program(&mut chip, 0x1FE, &[0x11, 0x22, 0x33, 0x44]);
    assert_eq!(&chip.image()[0x1FE..0x200], &[0x11, 0x22]);
    assert_eq!(&chip.image()[0x100..0x102], &[0x33, 0x44]);
    // The following page is untouched.
    assert_eq!(chip.image()[0x200], 0xFF);
}

#[test]
fn test_program_only_clears_bits() {
    let mut chip = blank_chip();
    program(&mut chip, 0, &[0xF0]);
    program(&mut chip, 0, &[0x3C]);
    assert_eq!(chip.image()[0], 0x30);
}

#[test]
fn test_program_needs_write_enable() {
    let mut chip = blank_chip();
    chip.command(&encode(Operation::PageProgram { address: 0, len: 1 })).unwrap();
    chip.transmit(&[0x00], TransferKind::Interrupt).unwrap();
    assert_eq!(chip.image()[0], 0xFF);
}

#[test]
fn test_erase_fills_sector() {
    let mut chip = SimChip::from_image(crate::geometry::MX25R6435F, &[0u8; 0x2000]).unwrap();
    chip.command(&encode(Operation::WriteEnable)).unwrap();
    chip.command(&encode(Operation::SectorErase { address: 0x1234 })).unwrap();
    assert!(chip.image()[0x1000..0x2000].iter().all(|b| *b == 0xFF));
    assert!(chip.image()[..0x1000].iter().all(|b| *b == 0x00));
    assert!(chip.status_register().get_wip());
}

#[test]
fn test_busy_counts_status_reads() {
    let mut chip = blank_chip();
    chip.hold_busy(BusyOp::Erase, 2);
    let mut sr = [0u8];
    for expected in &[true, true, false] {
        chip.command(&encode(Operation::ReadStatus)).unwrap();
        chip.receive(&mut sr, TransferKind::Blocking).unwrap();
        assert_eq!(StatusRegister(sr[0]).get_wip(), *expected);
    }
}

#[test]
fn test_suspend_and_resume() {
    let mut chip = blank_chip();
    chip.hold_busy(BusyOp::Erase, 10);
    chip.command(&encode(Operation::Suspend)).unwrap();
    assert!(chip.is_suspended());
    assert!(chip.security_register().get_esb());
    assert!(!chip.status_register().get_wip());
    chip.command(&encode(Operation::Resume)).unwrap();
    assert!(!chip.is_suspended());
    assert!(chip.status_register().get_wip());
}

#[test]
fn test_deep_power_down_ignores_wake_command() {
    let mut chip = blank_chip();
    chip.command(&encode(Operation::EnterDeepPowerDown)).unwrap();
    assert!(chip.is_powered_down());
    chip.command(&encode(Operation::WriteEnable)).unwrap();
    assert!(!chip.is_powered_down());
    assert!(!chip.status_register().get_wel());
}

#[test]
fn test_reset_needs_enable() {
    let mut chip = blank_chip();
    chip.command(&encode(Operation::WriteEnable)).unwrap();
    chip.command(&encode(Operation::Reset)).unwrap();
    assert!(chip.status_register().get_wel());
    chip.command(&encode(Operation::EnableReset)).unwrap();
    chip.command(&encode(Operation::Reset)).unwrap();
    assert!(!chip.status_register().get_wel());
}

#[test]
fn test_data_phase_must_match_command() {
    let mut chip = blank_chip();
    chip.command(&encode(Operation::ReadStatus)).unwrap();
    let mut buf = [0u8; 1];
    assert!(chip.receive(&mut buf, TransferKind::Interrupt).is_err());
    assert!(chip.receive(&mut buf, TransferKind::Blocking).is_err());
}

#[test]
fn test_image_too_large() {
    let geometry = crate::geometry::MX25R6435F;
    assert!(SimChip::from_image(geometry, &vec![0u8; geometry.capacity + 1]).is_err());
}
