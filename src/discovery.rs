use crate::error::{Error, Result};
use crate::session::BootloaderSession;
use crate::transport::{ApplicationDevice, Transport};
use crate::POLL_INTERVAL;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

/// Source of devices in either firmware mode.
pub trait DeviceEnumerator {
    /// Connection to a device in bootloader mode.
    type Transport: Transport;

    /// A device in application mode.
    type Application: ApplicationDevice;

    /// Opens a device in bootloader mode, if one is connected.
    fn find_bootloader(&mut self) -> Result<Option<Self::Transport>>;

    /// Opens a device in application mode, if one is connected. Devices whose location is in
    /// `skip` are left alone.
    fn find_application(
        &mut self,
        skip: &HashSet<(u8, u8)>,
    ) -> Result<Option<Self::Application>>;
}

/// Waits for a bootloader to show up, asking devices still running their application to restart
/// into the bootloader.
pub struct Discovery<E> {
    enumerator: E,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<E: DeviceEnumerator> Discovery<E> {
    /// Creates a discovery without a timeout.
    pub fn new(enumerator: E) -> Self {
        Self {
            enumerator,
            timeout: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Limits how long [`wait`] keeps polling. `None` polls forever.
    ///
    /// [`wait`]: #method.wait
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delay between two polls.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn into_inner(self) -> E {
        self.enumerator
    }

    /// Polls until a bootloader is found and returns a session for it.
    ///
    /// Every application-mode device is sent a single request to enter the bootloader; it is
    /// expected to come back in bootloader mode after a while. Failures of that request are
    /// tolerated, as the device might drop off the bus before acknowledging it.
    pub fn wait(&mut self) -> Result<BootloaderSession<E::Transport>> {
        let started = Instant::now();
        let mut requested = HashSet::new();
        let mut polls = 0usize;

        loop {
            polls += 1;
            if let Some(transport) = self.enumerator.find_bootloader()? {
                debug!("Bootloader found after {} polls", polls);
                return Ok(BootloaderSession::new(transport));
            }

            if let Some(mut application) = self.enumerator.find_application(&requested)? {
                if requested.insert(application.location()) {
                    info!("Switching device into bootloader mode");
                    if let Err(error) = application.enter_bootloader() {
                        warn!("Request to enter the bootloader failed: {}", error);
                    }
                }
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    return Err(Error::DiscoveryTimeout(timeout));
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}
