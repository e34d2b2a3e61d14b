// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! The transport engine issues encoded commands on the link, then runs
//! their data phase either as a blocking transfer or as an interrupt-driven
//! transfer whose completion is awaited through the driver's signals.

use crate::command::{Command, Direction, Encoder, Operation, TransferKind};
use crate::config::{Config, Timing};
use crate::link::Link;
use crate::sync::DriverState;
use crate::{Error, Result};

/// Buffer for the data phase of a command.
#[derive(Debug)]
pub enum Data<'a> {
    None,
    Transmit(&'a [u8]),
    Receive(&'a mut [u8]),
}

impl<'a> Data<'a> {
    fn direction(&self) -> Option<Direction> {
        match self {
            Data::None => None,
            Data::Transmit(_) => Some(Direction::Transmit),
            Data::Receive(_) => Some(Direction::Receive),
        }
    }

    fn len(&self) -> usize {
        match self {
            Data::None => 0,
            Data::Transmit(data) => data.len(),
            Data::Receive(buf) => buf.len(),
        }
    }
}

/// One in-flight interrupt-driven data phase.
///
/// Exists only once the link has accepted the transfer. The handle keeps
/// the buffer borrowed until it is dropped, after the completion arrives
/// or the wait for it times out.
struct TransferHandle<'b> {
    data: Data<'b>,
    opcode: u8,
    completed: bool,
}

impl<'b> TransferHandle<'b> {
    fn start<L: Link>(link: &mut L, state: &DriverState, opcode: u8, mut data: Data<'b>)
        -> Result<Self>
    {
        // Completions from transfers abandoned after a timeout may still be
        // pending, and must not end the wait for this one.
        if let Some(direction) = data.direction() {
            state.drain(direction);
        }
        match &mut data {
            Data::Transmit(tx) => link.transmit_async(tx)?,
            Data::Receive(rx) => link.receive_async(rx)?,
            Data::None => (),
        }
        Ok(TransferHandle { data, opcode, completed: false })
    }

    fn finish(mut self, state: &DriverState, timing: &Timing) -> Result<()> {
        if let Some(direction) = self.data.direction() {
            state.wait_for(direction, timing.transfer)?;
        }
        self.completed = true;
        Ok(())
    }
}

impl<'b> Drop for TransferHandle<'b> {
    fn drop(&mut self) {
        if self.completed {
            log::trace!("Released {} byte transfer for 0x{:02X}", self.data.len(), self.opcode);
        } else {
            log::debug!("Abandoned {} byte transfer for 0x{:02X}", self.data.len(), self.opcode);
        }
    }
}

/// Issues commands on a link.
///
/// Register accesses run as blocking transfers and work as soon as the
/// transport exists. Array reads and programs run as interrupt-driven
/// transfers, which need the [`DriverState`] installed by `attach()`.
pub struct Transport<L: Link> {
    link: L,
    encoder: Encoder,
    timing: Timing,
    state: Option<DriverState>,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L, config: &Config) -> Self {
        Transport { link, encoder: Encoder::new(config), timing: config.timing, state: None }
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Consume the transport, returning the link.
    pub fn into_link(mut self) -> L {
        self.detach();
        self.link
    }

    /// Install driver state and hand its completion callbacks to the link.
    pub fn attach(&mut self, state: DriverState) {
        log::debug!("Attaching completion callbacks to link");
        self.link.attach(state.callbacks());
        self.state = Some(state);
    }

    /// Remove the driver state and its callbacks from the link.
    pub fn detach(&mut self) -> Option<DriverState> {
        let state = self.state.take();
        if state.is_some() {
            log::debug!("Detaching completion callbacks from link");
            self.link.detach();
        }
        state
    }

    pub fn is_attached(&self) -> bool {
        self.state.is_some()
    }

    /// Encode `op` and issue it with `data` as its data phase.
    pub fn execute(&mut self, op: Operation, data: Data<'_>) -> Result<()> {
        let cmd = self.encoder.encode(op);
        self.issue(&cmd, data)
    }

    /// Encode and issue an operation which has no data phase.
    pub fn command(&mut self, op: Operation) -> Result<()> {
        self.execute(op, Data::None)
    }

    /// Issue `cmd` on the link, then run its data phase using `data`.
    ///
    /// Interrupt-driven data phases wait up to the transfer timeout for
    /// their completion signal. There are no retries: the first failure
    /// is returned.
    ///
    /// Panics if `data` does not match the direction and length of the
    /// command's data phase, or if `cmd` is a memory-mapped template.
    pub fn issue(&mut self, cmd: &Command, data: Data<'_>) -> Result<()> {
        let phase = cmd.data;
        assert_eq!(phase.map(|p| p.direction), data.direction(),
                   "issue: data direction does not match command");
        assert_eq!(cmd.data_len(), data.len(), "issue: data length does not match command");

        let kind = phase.map(|p| p.kind);
        assert!(kind != Some(TransferKind::MemoryMapped),
                "issue: memory-mapped templates cannot be issued");
        if kind == Some(TransferKind::Interrupt) && self.state.is_none() {
            log::error!("Interrupt-driven transfer requested before initialisation");
            return Err(Error::NotInitialized);
        }

        log::trace!("Command 0x{:02X} addr {:?} data {:?}",
                    cmd.instruction(), cmd.address.map(|a| a.value), phase);
        self.link.send_command(cmd, self.timing.command)?;

        match (kind, data) {
            (None, _) | (_, Data::None) => Ok(()),
            (Some(TransferKind::Blocking), Data::Transmit(tx)) => {
                log::trace!("Transmit {:02X?}", tx);
                self.link.transmit_blocking(tx, self.timing.command)?;
                Ok(())
            },
            (Some(TransferKind::Blocking), Data::Receive(rx)) => {
                self.link.receive_blocking(rx, self.timing.command)?;
                log::trace!("Received {:02X?}", rx);
                Ok(())
            },
            (Some(_), data) => {
                let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
                let handle = TransferHandle::start(&mut self.link, state, cmd.instruction(), data)?;
                handle.finish(state, &self.timing)
            },
        }
    }
}

#[cfg(test)]
use crate::sim::{SimChip, SimLink};
#[cfg(test)]
use crate::command::Opcode;
#[cfg(test)]
use crate::sync::semaphore;

#[cfg(test)]
fn test_transport() -> Transport<SimLink> {
    let config = Config::mx25r6435f();
    Transport::new(SimLink::new(SimChip::new(config.geometry)), &config)
}

#[test]
fn test_blocking_register_read() {
    let mut transport = test_transport();
    transport.link_mut().chip_mut().set_status_register(0x40);
    let mut sr = [0u8; 1];
    transport.execute(Operation::ReadStatus, Data::Receive(&mut sr)).unwrap();
    assert_eq!(sr[0], 0x40);
    assert_eq!(transport.link().chip().opcodes(), vec![Opcode::ReadStatusRegister]);
}

#[test]
fn test_interrupt_transfer_needs_state() {
    let mut transport = test_transport();
    let mut buf = [0u8; 16];
    let result = transport.execute(Operation::ReadArray { address: 0, len: 16 },
                                   Data::Receive(&mut buf));
    assert!(matches!(result, Err(Error::NotInitialized)));
    // Nothing reached the chip.
    assert!(transport.link().chip().commands().is_empty());
}

#[test]
fn test_interrupt_transfer_completes() {
    let mut transport = test_transport();
    transport.attach(DriverState::new(semaphore));
    let mut buf = [0u8; 16];
    transport.execute(Operation::ReadArray { address: 0, len: 16 },
                      Data::Receive(&mut buf)).unwrap();
    assert_eq!(buf, [0xFF; 16]);
}

#[test]
fn test_interrupt_transfer_timeout() {
    let mut config = Config::mx25r6435f();
    config.timing.transfer = std::time::Duration::from_millis(20);
    let mut transport = Transport::new(SimLink::new(SimChip::new(config.geometry)), &config);
    transport.attach(DriverState::new(semaphore));
    transport.link_mut().chip_mut().faults.drop_completions = true;
    let mut buf = [0u8; 4];
    let result = transport.execute(Operation::ReadArray { address: 0, len: 4 },
                                   Data::Receive(&mut buf));
    assert!(matches!(result, Err(Error::TransferTimeout(Direction::Receive))));
}

#[test]
fn test_late_completion_is_discarded() {
    let mut config = Config::mx25r6435f();
    config.timing.transfer = std::time::Duration::from_millis(20);
    let mut transport = Transport::new(SimLink::new(SimChip::new(config.geometry)), &config);
    transport.attach(DriverState::new(semaphore));
    transport.link_mut().chip_mut().faults.completion_delay =
        Some(std::time::Duration::from_millis(60));
    let mut buf = [0u8; 4];
    let result = transport.execute(Operation::ReadArray { address: 0, len: 4 },
                                   Data::Receive(&mut buf));
    assert!(matches!(result, Err(Error::TransferTimeout(Direction::Receive))));

    // Let the late completion arrive, then make the next transfer never complete.
    std::thread::sleep(std::time::Duration::from_millis(100));
    transport.link_mut().chip_mut().faults.completion_delay = None;
    transport.link_mut().chip_mut().faults.drop_completions = true;
    let result = transport.execute(Operation::ReadArray { address: 0, len: 4 },
                                   Data::Receive(&mut buf));
    assert!(matches!(result, Err(Error::TransferTimeout(Direction::Receive))));
}

#[test]
fn test_link_rejection_is_surfaced() {
    let mut transport = test_transport();
    transport.link_mut().chip_mut().faults.reject_opcode = Some(Opcode::WriteEnable);
    let result = transport.command(Operation::WriteEnable);
    assert!(matches!(result, Err(Error::Link(_))));
}

#[test]
fn test_detach_removes_callbacks() {
    let mut transport = test_transport();
    transport.attach(DriverState::new(semaphore));
    assert!(transport.link().is_attached());
    assert!(transport.detach().is_some());
    assert!(!transport.link().is_attached());
    assert!(transport.detach().is_none());
}

#[test]
#[should_panic]
fn test_issue_length_mismatch_panics() {
    let mut transport = test_transport();
    let mut buf = [0u8; 2];
    let _ = transport.execute(Operation::ReadStatus, Data::Receive(&mut buf));
}
