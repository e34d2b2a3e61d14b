// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Interface to the serial link peripheral the flash is attached to.

use std::time::Duration;
use crate::command::Command;
use crate::sync::CompletionCallbacks;

/// Trait for peripherals which carry commands to a serial NOR flash.
///
/// A command is sent with `send_command()`, which runs the instruction,
/// address, mode byte and dummy phases. If the command has a data phase,
/// it is then run by exactly one of the four transfer methods, with a
/// buffer of exactly the command's data length.
///
/// The `_async` methods only start the transfer. When it completes, the
/// provider must call `on_receive_complete()` or `on_transmit_complete()`
/// on the callbacks passed to `attach()`; this may happen from an
/// interrupt handler or another thread, and may happen before the
/// `_async` method has returned. The buffer passed to an `_async` method
/// remains borrowed by the driver until that completion is observed or
/// times out.
pub trait Link {
    /// Send the non-data phases of `cmd`.
    fn send_command(&mut self, cmd: &Command, timeout: Duration) -> anyhow::Result<()>;

    /// Transmit the data phase of the last command, blocking until done.
    fn transmit_blocking(&mut self, data: &[u8], timeout: Duration) -> anyhow::Result<()>;

    /// Receive the data phase of the last command, blocking until done.
    fn receive_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> anyhow::Result<()>;

    /// Start transmitting the data phase of the last command.
    fn transmit_async(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Start receiving the data phase of the last command.
    fn receive_async(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Register the callbacks to invoke when asynchronous transfers complete.
    fn attach(&mut self, callbacks: CompletionCallbacks);

    /// Remove previously attached callbacks.
    fn detach(&mut self);

    /// Switch the peripheral to memory-mapped mode using the given
    /// read and write command templates.
    ///
    /// Peripherals without memory-mapped support keep the default,
    /// which returns an error.
    fn enable_memory_mapped(&mut self, read: &Command, write: &Command) -> anyhow::Result<()> {
        let _ = (read, write);
        anyhow::bail!("memory-mapped mode is not supported by this link")
    }
}

impl<L: Link + ?Sized> Link for &mut L {
    fn send_command(&mut self, cmd: &Command, timeout: Duration) -> anyhow::Result<()> {
        (**self).send_command(cmd, timeout)
    }

    fn transmit_blocking(&mut self, data: &[u8], timeout: Duration) -> anyhow::Result<()> {
        (**self).transmit_blocking(data, timeout)
    }

    fn receive_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> anyhow::Result<()> {
        (**self).receive_blocking(buf, timeout)
    }

    fn transmit_async(&mut self, data: &[u8]) -> anyhow::Result<()> {
        (**self).transmit_async(data)
    }

    fn receive_async(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        (**self).receive_async(buf)
    }

    fn attach(&mut self, callbacks: CompletionCallbacks) {
        (**self).attach(callbacks)
    }

    fn detach(&mut self) {
        (**self).detach()
    }

    fn enable_memory_mapped(&mut self, read: &Command, write: &Command) -> anyhow::Result<()> {
        (**self).enable_memory_mapped(read, write)
    }
}
