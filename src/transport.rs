use crate::error::{Error, Result};
use crate::frame::FRAME_SIZE;
use log::{debug, trace};
use rusb::{ConfigDescriptor, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;

/// USB interface class of HID devices.
const HID_CLASS: u8 = 0x03;

/// libusb treats a zero timeout as no timeout at all.
const NO_TIMEOUT: Duration = Duration::ZERO;

/// A bidirectional, frame-oriented channel to a device.
pub trait Transport {
    /// Sends a single frame.
    fn write(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()>;

    /// Receives a single frame. Without a timeout, this blocks until the device answers or the
    /// channel fails. A timeout surfaces as [`Error::Timeout`].
    ///
    /// [`Error::Timeout`]: enum.Error.html#variant.Timeout
    fn read(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()> {
        (**self).write(frame)
    }

    fn read(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        (**self).read(timeout)
    }
}

/// A device running its application firmware, which can be asked to restart into the bootloader.
pub trait ApplicationDevice {
    /// USB bus number and device address, identifying the device for as long as it stays
    /// connected.
    fn location(&self) -> (u8, u8);

    /// Requests a restart into the bootloader. The device may drop off the bus while answering.
    fn enter_bootloader(&mut self) -> Result<()>;
}

/// Frame transport over the interrupt endpoints of a device's HID interface.
///
/// The interface is claimed for the lifetime of the transport and released when it is dropped.
pub struct UsbTransport<T: UsbContext> {
    /// USB device handle for the raw communication.
    handle: DeviceHandle<T>,

    /// Number of the claimed HID interface.
    interface: u8,

    /// Interrupt IN endpoint address.
    in_endpoint: u8,

    /// Interrupt OUT endpoint address.
    out_endpoint: u8,

    /// USB endpoint buffer size for the interrupt IN endpoint.
    in_buffer_length: u16,
}

impl<T: UsbContext> UsbTransport<T> {
    /// Opens the device and claims its HID interface. Fails with `NotFound` if the device has no
    /// HID interface with an interrupt endpoint in each direction.
    pub fn open(device: &Device<T>) -> Result<Self> {
        let config = device.active_config_descriptor()?;
        let endpoints = find_hid_endpoints(&config).ok_or(Error::Usb(rusb::Error::NotFound))?;

        let mut handle = device.open()?;
        // Not supported on every platform; claiming fails later if a driver is really in the way
        if let Err(error) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Cannot detach kernel driver automatically: {}", error);
        }
        handle.claim_interface(endpoints.interface)?;
        debug!(
            "Claimed interface {} (IN 0x{:02x}, OUT 0x{:02x}) on bus {} address {}",
            endpoints.interface,
            endpoints.in_endpoint,
            endpoints.out_endpoint,
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle,
            interface: endpoints.interface,
            in_endpoint: endpoints.in_endpoint,
            out_endpoint: endpoints.out_endpoint,
            in_buffer_length: endpoints.in_buffer_length,
        })
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    fn write(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()> {
        trace!("-> {:02x?}", &frame[..]);
        let written = self
            .handle
            .write_interrupt(self.out_endpoint, frame, NO_TIMEOUT)?;
        if written != FRAME_SIZE {
            return Err(Error::Usb(rusb::Error::Io));
        }
        Ok(())
    }

    fn read(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; usize::from(self.in_buffer_length).max(FRAME_SIZE)];
        let read = self.handle.read_interrupt(
            self.in_endpoint,
            &mut buffer,
            timeout.unwrap_or(NO_TIMEOUT),
        )?;
        buffer.truncate(read);
        trace!("<- {:02x?}", buffer);
        Ok(buffer)
    }
}

impl<T: UsbContext> Drop for UsbTransport<T> {
    fn drop(&mut self) {
        if let Err(error) = self.handle.release_interface(self.interface) {
            // Expected after the device rebooted
            debug!("Releasing interface {} failed: {}", self.interface, error);
        }
    }
}

struct HidEndpoints {
    interface: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    in_buffer_length: u16,
}

/// Looks for the first HID interface providing an interrupt endpoint in both directions.
fn find_hid_endpoints(config: &ConfigDescriptor) -> Option<HidEndpoints> {
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != HID_CLASS {
                continue;
            }

            let mut in_endpoint = None;
            let mut out_endpoint = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => {
                        in_endpoint = Some((endpoint.address(), endpoint.max_packet_size()))
                    }
                    Direction::Out => out_endpoint = Some(endpoint.address()),
                }
            }

            if let (Some((in_endpoint, in_buffer_length)), Some(out_endpoint)) =
                (in_endpoint, out_endpoint)
            {
                return Some(HidEndpoints {
                    interface: descriptor.interface_number(),
                    in_endpoint,
                    out_endpoint,
                    in_buffer_length,
                });
            }
        }
    }
    None
}
