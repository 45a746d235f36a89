use crate::error::{Error, Result};
use crate::flash::{AddressedBlock, PAGE_SIZE, SECTOR_SIZE};
use crate::frame::{crc32, data_frame, Command, StatusFrame};
use crate::operation::Program;
use crate::transport::Transport;
use crate::{RESET_DRAIN_ATTEMPTS, RESET_DRAIN_TIMEOUT, RESET_REPEAT};
use log::{debug, trace, warn};

/// Progress of a session through the bootloader protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Freshly opened, the device may still hold a half-received command.
    Connected,

    /// Stale commands and responses have been flushed.
    Synchronized,

    /// At least one page has been programmed.
    Programming,

    /// The device left the bootloader to start the application.
    Exited,

    /// The device left the bootloader without starting the application.
    Aborted,
}

/// Result of asking the bootloader to exit or abort.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitOutcome {
    /// The connection broke down, which is what a rebooting device does.
    DeviceRebooted,

    /// The device answered normally, so it is still in the bootloader.
    UnexpectedResponse(StatusFrame),
}

/// An open connection to a device in bootloader mode.
///
/// The session owns its transport; dropping the session closes the connection.
pub struct BootloaderSession<T: Transport> {
    transport: T,
    state: SessionState,
}

impl<T: Transport> BootloaderSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: SessionState::Connected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gives up the session, returning the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Flushes whatever a previous, interrupted session left behind.
    ///
    /// The reset command is sent several times without waiting for answers, so that any partially
    /// received frame on the device is completed and discarded. Then status frames still queued
    /// on the device are read until a read times out. Timeouts are expected here and not an error.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;

        debug!("Sending {}", Command::Reset);
        let frame = Command::Reset.encode();
        for _ in 0..RESET_REPEAT {
            self.transport.write(&frame)?;
        }

        for _ in 0..RESET_DRAIN_ATTEMPTS {
            match self.transport.read(Some(RESET_DRAIN_TIMEOUT)) {
                Ok(packet) => warn!("Discarding stale response of {} bytes", packet.len()),
                Err(Error::Timeout) => break,
                Err(error) => return Err(error),
            }
        }

        self.state = SessionState::Synchronized;
        Ok(())
    }

    /// Erases the flash sector containing the address.
    pub fn erase(&mut self, address: u32) -> Result<()> {
        self.ensure_open()?;
        self.command(Command::Erase { address }).map(|_| ())
    }

    /// Programs one page of flash. The page has to be exactly [`PAGE_SIZE`] bytes and aligned to
    /// it; anything else is rejected before talking to the device.
    ///
    /// The first page of every sector erases that sector. The page is announced along with the
    /// checksums of both halves, then the halves are transferred one frame each. Every step has to
    /// be acknowledged with a zero status; the first nonzero status ends the operation.
    ///
    /// [`PAGE_SIZE`]: constant.PAGE_SIZE.html
    pub fn program(&mut self, page: &AddressedBlock) -> Result<()> {
        self.ensure_open()?;
        if !page.is_page(PAGE_SIZE) {
            return Err(Error::InvalidPage {
                address: page.address(),
                length: page.len(),
            });
        }
        self.state = SessionState::Programming;

        if page.address() & (SECTOR_SIZE - 1) == 0 {
            self.erase(page.address())?;
        }

        self.command(Command::program_start(page))?;

        let (lower, upper) = page.halves();
        self.transport.write(&data_frame(lower)?)?;
        self.status()?.check()?;
        self.transport.write(&data_frame(upper)?)?;
        let status = self.status()?;
        status.check()?;

        // Only for diagnostics, the status flag is what counts
        if status.crc32_lower != crc32(lower.data()) || status.crc32_upper != crc32(upper.data()) {
            debug!(
                "Device checksums 0x{:08x}/0x{:08x} differ for page 0x{:08x}",
                status.crc32_lower,
                status.crc32_upper,
                page.address()
            );
        }
        Ok(())
    }

    /// Programs a sequence of pages, reporting progress. See [`Operation`].
    ///
    /// [`Operation`]: trait.Operation.html
    pub fn program_pages<I>(&mut self, pages: I) -> Program<'_, T, I::IntoIter>
    where
        I: IntoIterator<Item = AddressedBlock>,
        I::IntoIter: ExactSizeIterator,
    {
        Program::pages(self, pages.into_iter())
    }

    /// Leaves the bootloader and starts the application with its vector table at `vector`.
    ///
    /// A successful exit reboots the device, breaking the connection. A regular answer means the
    /// device is still in the bootloader.
    pub fn exit(&mut self, vector: u32) -> Result<ExitOutcome> {
        self.finish(Command::Exit { vector }, SessionState::Exited)
    }

    /// Leaves the bootloader without starting the application. Reports the outcome like [`exit`].
    ///
    /// [`exit`]: #method.exit
    pub fn abort(&mut self) -> Result<ExitOutcome> {
        self.finish(Command::Abort, SessionState::Aborted)
    }

    fn finish(&mut self, command: Command, state: SessionState) -> Result<ExitOutcome> {
        self.ensure_open()?;

        debug!("Sending {}", command);
        let transport = &mut self.transport;
        let reply = transport
            .write(&command.encode())
            .and_then(|()| transport.read(None));

        match reply {
            Ok(packet) => {
                let status = StatusFrame::try_from(packet.as_slice())?;
                warn!("Device answered {} with status {}", command, status.flags);
                Ok(ExitOutcome::UnexpectedResponse(status))
            }
            Err(error) if error.is_transport() => {
                debug!("Connection lost after {}: {}", command, error);
                self.state = state;
                Ok(ExitOutcome::DeviceRebooted)
            }
            Err(error) => Err(error),
        }
    }

    /// Sends a command and waits for its status, failing on nonzero flags.
    fn command(&mut self, command: Command) -> Result<StatusFrame> {
        debug!("Sending {}", command);
        self.transport.write(&command.encode())?;
        let status = self.status()?;
        status.check()?;
        Ok(status)
    }

    /// Waits for a status frame, without a timeout.
    fn status(&mut self) -> Result<StatusFrame> {
        let packet = self.transport.read(None)?;
        let status = StatusFrame::try_from(packet.as_slice())?;
        trace!(
            "Status for 0x{:08x}: flags {}",
            status.last_command,
            status.flags
        );
        Ok(status)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Exited | SessionState::Aborted => Err(Error::SessionClosed),
            _ => Ok(()),
        }
    }
}
