// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Chip status registers and polling for operation completion.

use std::fmt;
use std::time::{Duration, Instant};
use crate::command::Operation;
use crate::link::Link;
use crate::transport::{Data, Transport};
use crate::{Error, Result};

/// Status Register
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    pub const WIP: u8 = 0b0000_0001;
    pub const WEL: u8 = 0b0000_0010;
    pub const QE: u8 = 0b0100_0000;

    /// Get WIP (write in progress) bit.
    pub fn get_wip(&self) -> bool {
        self.0 & Self::WIP != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & Self::WEL != 0
    }

    /// Get QE (quad enable) bit.
    pub fn get_qe(&self) -> bool {
        self.0 & Self::QE != 0
    }

    fn set_qe(&mut self, qe: bool) {
        self.0 &= !Self::QE;
        self.0 |= (qe as u8) << 6;
    }
}

/// Security Register
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SecurityRegister(pub u8);

impl SecurityRegister {
    pub const PSB: u8 = 0b0000_0100;
    pub const ESB: u8 = 0b0000_1000;
    pub const P_FAIL: u8 = 0b0010_0000;
    pub const E_FAIL: u8 = 0b0100_0000;

    /// Get PSB (program suspended) bit.
    pub fn get_psb(&self) -> bool {
        self.0 & Self::PSB != 0
    }

    /// Get ESB (erase suspended) bit.
    pub fn get_esb(&self) -> bool {
        self.0 & Self::ESB != 0
    }

    /// Get P_FAIL bit, set when the last program did not complete.
    pub fn get_program_fail(&self) -> bool {
        self.0 & Self::P_FAIL != 0
    }

    /// Get E_FAIL bit, set when the last erase did not complete.
    pub fn get_erase_fail(&self) -> bool {
        self.0 & Self::E_FAIL != 0
    }
}

/// Configuration Registers 1 and 2, in the order the chip sends them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConfigRegister(pub [u8; 2]);

impl ConfigRegister {
    /// L/H switch in configuration register 2.
    pub const LH_SWITCH: u8 = 0b0000_0010;

    /// Get L/H switch bit; set for high-performance mode.
    pub fn get_high_performance(&self) -> bool {
        self.0[1] & Self::LH_SWITCH != 0
    }

    fn set_high_performance(&mut self, hp: bool) {
        self.0[1] &= !Self::LH_SWITCH;
        self.0[1] |= (hp as u8) << 1;
    }
}

/// Combined view of the status and security registers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StatusFlags {
    pub write_in_progress: bool,
    pub write_enable_latch: bool,
    pub program_fail: bool,
    pub erase_fail: bool,
    pub program_suspended: bool,
    pub erase_suspended: bool,
}

impl StatusFlags {
    pub fn from_registers(status: StatusRegister, security: SecurityRegister) -> Self {
        StatusFlags {
            write_in_progress: status.get_wip(),
            write_enable_latch: status.get_wel(),
            program_fail: security.get_program_fail(),
            erase_fail: security.get_erase_fail(),
            program_suspended: security.get_psb(),
            erase_suspended: security.get_esb(),
        }
    }

    /// Chip state these flags describe.
    ///
    /// Failure takes precedence over suspension, which takes precedence
    /// over the busy bit.
    pub fn chip_status(&self) -> ChipStatus {
        if self.program_fail || self.erase_fail {
            ChipStatus::Failed
        } else if self.program_suspended || self.erase_suspended {
            ChipStatus::Suspended
        } else if self.write_in_progress {
            ChipStatus::Busy
        } else {
            ChipStatus::Ready
        }
    }
}

/// Chip-level state, as reported by `NorFlash::get_status()`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChipStatus {
    Ready,
    Busy,
    Suspended,
    Failed,
}

impl fmt::Display for ChipStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChipStatus::Ready => write!(f, "ready"),
            ChipStatus::Busy => write!(f, "busy"),
            ChipStatus::Suspended => write!(f, "suspended"),
            ChipStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Polls the status register until `(status & mask) == matches`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Poller {
    pub mask: u8,
    pub matches: u8,
}

impl Poller {
    pub fn new(mask: u8, matches: u8) -> Self {
        Poller { mask, matches }
    }

    /// Wait for the WIP bit to clear.
    pub fn ready() -> Self {
        Poller::new(StatusRegister::WIP, 0)
    }

    /// Wait for the WEL bit to be set.
    pub fn write_enabled() -> Self {
        Poller::new(StatusRegister::WEL, StatusRegister::WEL)
    }

    /// Read the status register until it matches or `timeout` elapses.
    ///
    /// The register is always read at least once, then again every poll
    /// interval. Returns the matching register value.
    pub fn poll_until_ready<L: Link>(&self, transport: &mut Transport<L>, timeout: Duration)
        -> Result<StatusRegister>
    {
        let interval = transport.timing().poll_interval;
        let t0 = Instant::now();
        let mut polls = 0;
        loop {
            let status = transport.read_status()?;
            polls += 1;
            if status.0 & self.mask == self.matches {
                log::trace!("Status 0x{:02X} matched after {} polls, {:?}",
                            status.0, polls, t0.elapsed());
                return Ok(status);
            }
            if t0.elapsed() >= timeout {
                log::error!("Status 0x{:02X} & 0x{:02X} != 0x{:02X} after {:?}",
                            status.0, self.mask, self.matches, timeout);
                return Err(Error::StatusTimeout {
                    mask: self.mask, matches: self.matches, timeout,
                });
            }
            std::thread::sleep(interval);
        }
    }
}

/// Register access, built on the transport's blocking transfers.
impl<L: Link> Transport<L> {
    /// Read the status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        let mut reg = [0u8; 1];
        self.execute(Operation::ReadStatus, Data::Receive(&mut reg))?;
        Ok(StatusRegister(reg[0]))
    }

    /// Read the security register.
    pub fn read_security(&mut self) -> Result<SecurityRegister> {
        let mut reg = [0u8; 1];
        self.execute(Operation::ReadSecurity, Data::Receive(&mut reg))?;
        Ok(SecurityRegister(reg[0]))
    }

    /// Read both configuration registers.
    pub fn read_config(&mut self) -> Result<ConfigRegister> {
        let mut reg = [0u8; 2];
        self.execute(Operation::ReadConfig { len: 2 }, Data::Receive(&mut reg))?;
        Ok(ConfigRegister(reg))
    }

    /// Read the security register, then the status register.
    pub fn read_flags(&mut self) -> Result<StatusFlags> {
        let security = self.read_security()?;
        let status = self.read_status()?;
        Ok(StatusFlags::from_registers(status, security))
    }

    /// Set the write enable latch and wait until the chip reports it set.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Operation::WriteEnable)?;
        let timeout = self.timing().command;
        Poller::write_enabled().poll_until_ready(self, timeout)?;
        Ok(())
    }

    /// Write the status register, followed by up to two configuration registers.
    ///
    /// Sets the write enable latch first and waits for the write to finish.
    pub fn write_status_config(&mut self, status: StatusRegister, config: Option<ConfigRegister>)
        -> Result<()>
    {
        let mut regs = vec![status.0];
        if let Some(config) = config {
            regs.extend_from_slice(&config.0);
        }
        log::debug!("Writing status/configuration registers {:02X?}", regs);
        self.write_enable()?;
        self.execute(Operation::WriteStatusConfig { len: regs.len() }, Data::Transmit(&regs))?;
        let timeout = self.timing().command;
        Poller::ready().poll_until_ready(self, timeout)?;
        Ok(())
    }

    /// Set the QE bit, leaving the rest of the status register unchanged.
    ///
    /// Returns the status register as read back after the write.
    pub fn set_quad_enable(&mut self) -> Result<StatusRegister> {
        let mut status = self.read_status()?;
        status.set_qe(true);
        self.write_status_config(status, None)?;
        self.read_status()
    }

    /// Set the L/H switch, leaving the other register bits unchanged.
    ///
    /// Returns the configuration registers as read back after the write.
    pub fn set_high_performance(&mut self) -> Result<ConfigRegister> {
        let status = self.read_status()?;
        let mut config = self.read_config()?;
        config.set_high_performance(true);
        self.write_status_config(status, Some(config))?;
        self.read_config()
    }
}

#[cfg(test)]
use crate::sim::{SimChip, SimLink};
#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::command::Opcode;

#[cfg(test)]
fn test_transport(config: &Config) -> Transport<SimLink> {
    Transport::new(SimLink::new(SimChip::new(config.geometry)), config)
}

#[test]
fn test_chip_status_precedence() {
    let flags = |sr, secr| StatusFlags::from_registers(StatusRegister(sr), SecurityRegister(secr));
    assert_eq!(flags(0x00, 0x00).chip_status(), ChipStatus::Ready);
    assert_eq!(flags(0x03, 0x00).chip_status(), ChipStatus::Busy);
    assert_eq!(flags(0x00, SecurityRegister::ESB).chip_status(), ChipStatus::Suspended);
    assert_eq!(flags(0x01, SecurityRegister::PSB).chip_status(), ChipStatus::Suspended);
    assert_eq!(flags(0x01, SecurityRegister::ESB | SecurityRegister::E_FAIL).chip_status(),
               ChipStatus::Failed);
    assert_eq!(flags(0x00, SecurityRegister::P_FAIL).chip_status(), ChipStatus::Failed);
}

#[test]
fn test_register_bits() {
    let mut sr = StatusRegister(0x03);
    assert!(sr.get_wip() && sr.get_wel() && !sr.get_qe());
    sr.set_qe(true);
    assert_eq!(sr.0, 0x43);
    let mut cr = ConfigRegister([0x00, 0x00]);
    cr.set_high_performance(true);
    assert_eq!(cr.0, [0x00, 0x02]);
    assert!(cr.get_high_performance());
}

#[test]
fn test_poll_until_ready() {
    let config = Config::mx25r6435f();
    let mut transport = test_transport(&config);
    transport.link_mut().chip_mut().hold_busy(crate::sim::BusyOp::Program, 3);
    let status = Poller::ready().poll_until_ready(&mut transport, config.timing.command).unwrap();
    assert!(!status.get_wip());
    // Three busy reads, then the ready one.
    assert_eq!(transport.link().chip().opcodes(), vec![Opcode::ReadStatusRegister; 4]);
}

#[test]
fn test_poll_timeout() {
    let config = Config::mx25r6435f();
    let mut transport = test_transport(&config);
    transport.link_mut().chip_mut().faults.stuck_busy = true;
    let t0 = Instant::now();
    let result = Poller::ready().poll_until_ready(&mut transport, Duration::from_millis(20));
    assert!(matches!(result, Err(Error::StatusTimeout { mask: 0x01, matches: 0x00, .. })));
    assert!(t0.elapsed() >= Duration::from_millis(20));
    assert!(t0.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_write_enable_sets_latch() {
    let config = Config::mx25r6435f();
    let mut transport = test_transport(&config);
    transport.write_enable().unwrap();
    assert!(transport.read_status().unwrap().get_wel());
}

#[test]
fn test_quad_and_high_performance_enable() {
    let config = Config::mx25r6435f();
    let mut transport = test_transport(&config);
    assert!(transport.set_quad_enable().unwrap().get_qe());
    assert!(transport.set_high_performance().unwrap().get_high_performance());
    // The status register write for high performance kept QE set.
    assert!(transport.read_status().unwrap().get_qe());
}
