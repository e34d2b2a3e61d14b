// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Protocol commands and the encoder which builds them.
//!
//! Every exchange with the chip is described by a [`Command`]: an opcode,
//! optional address and mode-byte phases, dummy cycles, and an optional
//! data phase, each phase with its own line width. The [`Encoder`] is the
//! only place commands are built, so per-chip details such as read dummy
//! cycles and the quad read mode byte live in one spot.

use std::fmt;
use num_enum::IntoPrimitive;
use crate::config::{Config, DummyCycles, ProgramMode, ReadMode};

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // Register access.
    WriteEnable = 0x06,
    ReadStatusRegister = 0x05,
    ReadConfigRegister = 0x15,
    WriteStatusConfigRegister = 0x01,
    ReadSecurityRegister = 0x2B,

    // Array access.
    FastRead = 0x0B,
    DualRead = 0xBB,
    QuadRead = 0xEB,
    PageProgram = 0x02,
    QuadPageProgram = 0x38,

    // Erase.
    SectorErase = 0x20,
    BlockErase = 0xD8,
    ChipErase = 0xC7,
    Suspend = 0xB0,
    Resume = 0x30,

    // Power and reset.
    DeepPowerDown = 0xB9,
    Nop = 0x00,
    EnableReset = 0x66,
    Reset = 0x99,
}

/// Number of data lines used for one phase of a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineWidth {
    Single,
    Dual,
    Quad,
    Octal,
}

impl LineWidth {
    pub fn lines(&self) -> u8 {
        match self {
            LineWidth::Single => 1,
            LineWidth::Dual => 2,
            LineWidth::Quad => 4,
            LineWidth::Octal => 8,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressSize {
    Bits24,
    Bits32,
}

impl AddressSize {
    pub fn bytes(&self) -> usize {
        match self {
            AddressSize::Bits24 => 3,
            AddressSize::Bits32 => 4,
        }
    }
}

/// Direction of a data phase, from the host's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Receive,
    Transmit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Receive => write!(f, "receive"),
            Direction::Transmit => write!(f, "transmit"),
        }
    }
}

/// How the transport runs a data phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// Blocking transfer, for short register accesses.
    Blocking,
    /// Transfer completed by an interrupt callback, for bulk array data.
    Interrupt,
    /// Template for memory-mapped access; never issued directly.
    MemoryMapped,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressPhase {
    pub value: u32,
    pub width: LineWidth,
    pub size: AddressSize,
}

/// Mode ("alternate") byte sent after the address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlternatePhase {
    pub value: u8,
    pub width: LineWidth,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataPhase {
    pub direction: Direction,
    pub width: LineWidth,
    /// Number of bytes; zero only for memory-mapped templates.
    pub len: usize,
    pub kind: TransferKind,
}

/// One fully specified protocol exchange.
///
/// The instruction phase is always sent on a single line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub opcode: Opcode,
    pub address: Option<AddressPhase>,
    pub alternate: Option<AlternatePhase>,
    pub dummy_cycles: u8,
    pub data: Option<DataPhase>,
}

impl Command {
    fn new(opcode: Opcode) -> Self {
        Command { opcode, address: None, alternate: None, dummy_cycles: 0, data: None }
    }

    fn address(mut self, value: u32, width: LineWidth, size: AddressSize) -> Self {
        self.address = Some(AddressPhase { value, width, size });
        self
    }

    fn alternate(mut self, value: u8, width: LineWidth) -> Self {
        self.alternate = Some(AlternatePhase { value, width });
        self
    }

    fn dummy(mut self, cycles: u8) -> Self {
        self.dummy_cycles = cycles;
        self
    }

    fn data(mut self, direction: Direction, width: LineWidth, len: usize, kind: TransferKind)
        -> Self
    {
        self.data = Some(DataPhase { direction, width, len, kind });
        self
    }

    /// Opcode as sent on the wire.
    pub fn instruction(&self) -> u8 {
        self.opcode.into()
    }

    /// Number of data bytes this command transfers, zero if there is no data phase.
    pub fn data_len(&self) -> usize {
        self.data.map(|d| d.len).unwrap_or(0)
    }
}

/// Operations the encoder knows how to express as a [`Command`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    ReadStatus,
    ReadSecurity,
    /// Read `len` configuration register bytes (1 or 2).
    ReadConfig { len: usize },
    /// Write status then configuration registers, `len` bytes (1 to 3).
    WriteStatusConfig { len: usize },
    ReadArray { address: u32, len: usize },
    PageProgram { address: u32, len: usize },
    SectorErase { address: u32 },
    BlockErase { address: u32 },
    ChipErase,
    WriteEnable,
    EnableReset,
    Reset,
    Suspend,
    Resume,
    EnterDeepPowerDown,
    /// A no-op instruction; toggling chip select wakes the chip from deep power-down.
    LeaveDeepPowerDown,
    MemoryMappedRead,
    MemoryMappedWrite,
}

/// Builds [`Command`]s for the configured chip and line widths.
#[derive(Copy, Clone, Debug)]
pub struct Encoder {
    read_mode: ReadMode,
    program_mode: ProgramMode,
    dummy_cycles: DummyCycles,
    mode_byte: u8,
    address_size: AddressSize,
}

impl Encoder {
    pub fn new(config: &Config) -> Self {
        // The chip is never switched to 4-byte address mode, and geometry
        // validation limits capacity to what 3 bytes can address.
        Encoder {
            read_mode: config.read_mode,
            program_mode: config.program_mode,
            dummy_cycles: config.dummy_cycles,
            mode_byte: config.no_enhance_mode_byte,
            address_size: AddressSize::Bits24,
        }
    }

    /// Build the command for `op`.
    ///
    /// Panics if a register length is outside what the chip supports.
    pub fn encode(&self, op: Operation) -> Command {
        use self::LineWidth::Single;
        use self::Direction::{Receive, Transmit};
        use self::TransferKind::{Blocking, Interrupt};

        match op {
            Operation::ReadStatus =>
                Command::new(Opcode::ReadStatusRegister).data(Receive, Single, 1, Blocking),
            Operation::ReadSecurity =>
                Command::new(Opcode::ReadSecurityRegister).data(Receive, Single, 1, Blocking),
            Operation::ReadConfig { len } => {
                assert!((1..=2).contains(&len), "encode: configuration register length must be 1 or 2");
                Command::new(Opcode::ReadConfigRegister).data(Receive, Single, len, Blocking)
            },
            Operation::WriteStatusConfig { len } => {
                assert!((1..=3).contains(&len), "encode: status/configuration write length must be 1 to 3");
                Command::new(Opcode::WriteStatusConfigRegister).data(Transmit, Single, len, Blocking)
            },
            Operation::ReadArray { address, len } =>
                self.read_array(address).data(Receive, self.read_width(), len, Interrupt),
            Operation::PageProgram { address, len } =>
                self.page_program(address).data(Transmit, self.program_width(), len, Interrupt),
            Operation::SectorErase { address } =>
                Command::new(Opcode::SectorErase).address(address, Single, self.address_size),
            Operation::BlockErase { address } =>
                Command::new(Opcode::BlockErase).address(address, Single, self.address_size),
            Operation::ChipErase => Command::new(Opcode::ChipErase),
            Operation::WriteEnable => Command::new(Opcode::WriteEnable),
            Operation::EnableReset => Command::new(Opcode::EnableReset),
            Operation::Reset => Command::new(Opcode::Reset),
            Operation::Suspend => Command::new(Opcode::Suspend),
            Operation::Resume => Command::new(Opcode::Resume),
            Operation::EnterDeepPowerDown => Command::new(Opcode::DeepPowerDown),
            Operation::LeaveDeepPowerDown => Command::new(Opcode::Nop),
            Operation::MemoryMappedRead =>
                self.read_array(0).data(Receive, self.read_width(), 0, TransferKind::MemoryMapped),
            Operation::MemoryMappedWrite =>
                self.page_program(0).data(Transmit, self.program_width(), 0, TransferKind::MemoryMapped),
        }
    }

    fn read_width(&self) -> LineWidth {
        match self.read_mode {
            ReadMode::Single => LineWidth::Single,
            ReadMode::Dual => LineWidth::Dual,
            ReadMode::Quad => LineWidth::Quad,
        }
    }

    fn program_width(&self) -> LineWidth {
        match self.program_mode {
            ProgramMode::Single => LineWidth::Single,
            ProgramMode::Quad => LineWidth::Quad,
        }
    }

    /// Instruction, address, mode byte and dummy phases of an array read.
    fn read_array(&self, address: u32) -> Command {
        let dummy = self.dummy_cycles.for_mode(self.read_mode);
        match self.read_mode {
            ReadMode::Single => Command::new(Opcode::FastRead)
                .address(address, LineWidth::Single, self.address_size)
                .dummy(dummy),
            ReadMode::Dual => Command::new(Opcode::DualRead)
                .address(address, LineWidth::Dual, self.address_size)
                .dummy(dummy),
            ReadMode::Quad => Command::new(Opcode::QuadRead)
                .address(address, LineWidth::Quad, self.address_size)
                .alternate(self.mode_byte, LineWidth::Quad)
                .dummy(dummy),
        }
    }

    fn page_program(&self, address: u32) -> Command {
        match self.program_mode {
            ProgramMode::Single => Command::new(Opcode::PageProgram)
                .address(address, LineWidth::Single, self.address_size),
            ProgramMode::Quad => Command::new(Opcode::QuadPageProgram)
                .address(address, LineWidth::Quad, self.address_size),
        }
    }
}

#[test]
fn test_encode_quad_read() {
    let encoder = Encoder::new(&Config::mx25r6435f());
    let cmd = encoder.encode(Operation::ReadArray { address: 0x1234, len: 300 });
    assert_eq!(cmd.instruction(), 0xEB);
    assert_eq!(cmd.address, Some(AddressPhase {
        value: 0x1234, width: LineWidth::Quad, size: AddressSize::Bits24 }));
    assert_eq!(cmd.alternate, Some(AlternatePhase { value: 0xAA, width: LineWidth::Quad }));
    assert_eq!(cmd.dummy_cycles, 4);
    assert_eq!(cmd.data, Some(DataPhase {
        direction: Direction::Receive, width: LineWidth::Quad, len: 300,
        kind: TransferKind::Interrupt }));
}

#[test]
fn test_encode_single_read_dummy_cycles() {
    let config = Config { read_mode: ReadMode::Single, ..Config::mx25r6435f() };
    let cmd = Encoder::new(&config).encode(Operation::ReadArray { address: 0, len: 1 });
    assert_eq!(cmd.opcode, Opcode::FastRead);
    assert_eq!(cmd.alternate, None);
    assert_eq!(cmd.dummy_cycles, 8);
    assert_eq!(cmd.data.unwrap().width, LineWidth::Single);

    let config = Config { read_mode: ReadMode::Dual, ..Config::mx25r6435f() };
    let cmd = Encoder::new(&config).encode(Operation::ReadArray { address: 0, len: 1 });
    assert_eq!(cmd.opcode, Opcode::DualRead);
    assert_eq!(cmd.address.unwrap().width, LineWidth::Dual);
    assert_eq!(cmd.dummy_cycles, 4);
}

#[test]
fn test_encode_program_and_erase() {
    let encoder = Encoder::new(&Config::mx25r6435f());
    let cmd = encoder.encode(Operation::PageProgram { address: 0x100, len: 256 });
    assert_eq!(cmd.instruction(), 0x38);
    assert_eq!(cmd.dummy_cycles, 0);
    assert_eq!(cmd.alternate, None);
    assert_eq!(cmd.data.unwrap().direction, Direction::Transmit);
    assert_eq!(cmd.data_len(), 256);

    let cmd = encoder.encode(Operation::BlockErase { address: 0x10000 });
    assert_eq!(cmd.instruction(), 0xD8);
    assert_eq!(cmd.address.unwrap().width, LineWidth::Single);
    assert_eq!(cmd.data, None);

    let cmd = encoder.encode(Operation::ChipErase);
    assert_eq!(cmd.instruction(), 0xC7);
    assert_eq!(cmd.address, None);
}

#[test]
fn test_encode_registers_are_blocking() {
    let encoder = Encoder::new(&Config::mx25r6435f());
    for op in &[Operation::ReadStatus, Operation::ReadSecurity,
                Operation::ReadConfig { len: 2 }, Operation::WriteStatusConfig { len: 3 }] {
        let data = encoder.encode(*op).data.unwrap();
        assert_eq!(data.kind, TransferKind::Blocking);
        assert_eq!(data.width, LineWidth::Single);
    }
}

#[test]
#[should_panic]
fn test_encode_bad_register_length() {
    Encoder::new(&Config::mx25r6435f()).encode(Operation::ReadConfig { len: 3 });
}

#[test]
fn test_encode_uses_3_byte_addresses() {
    let mut config = Config::mx25r6435f();
    config.geometry.capacity = 16 * 1024 * 1024;
    let encoder = Encoder::new(&config);
    let cmd = encoder.encode(Operation::SectorErase { address: 0xFFF000 });
    assert_eq!(cmd.address.unwrap().size, AddressSize::Bits24);
    let cmd = encoder.encode(Operation::ReadArray { address: 0xFFFF00, len: 256 });
    assert_eq!(cmd.address.unwrap().size.bytes(), 3);
}
