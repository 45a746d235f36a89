use crate::device::{DeviceConfig, DeviceInfo, DeviceMode};
use crate::discovery::DeviceEnumerator;
use crate::error::Result;
use crate::frame::enter_bootloader_frame;
use crate::transport::{ApplicationDevice, Transport, UsbTransport};
use log::{debug, info};
use std::collections::HashSet;
use rusb::{Device, UsbContext};

/// Finds fader devices on the USB and opens connections to them.
pub struct Context<T: UsbContext = rusb::Context> {
    usb_context: T,
    config: DeviceConfig,
}

impl Context<rusb::Context> {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let usb_context = rusb::Context::new()?;
        Ok(Self::with_usb_context(usb_context, config))
    }
}

impl<T: UsbContext> Context<T> {
    pub fn with_usb_context(usb_context: T, config: DeviceConfig) -> Self {
        Context {
            usb_context,
            config,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Lists all connected devices in either mode. Devices whose descriptors cannot be read (e.g.
    /// for lack of permissions) are skipped.
    pub fn find_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .matching_devices()?
            .into_iter()
            .map(|(_, info)| info)
            .collect())
    }

    fn matching_devices(&self) -> Result<Vec<(Device<T>, DeviceInfo)>> {
        let mut devices = Vec::new();

        for device in self.usb_context.devices()?.iter() {
            match identify(&device, &self.config) {
                Ok(Some(info)) => devices.push((device, info)),
                Ok(None) => {}
                Err(error) => debug!(
                    "Skipping device on bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    error
                ),
            }
        }

        Ok(devices)
    }

    /// Opens the first device accepted by the filter. Devices disappearing while being opened are
    /// treated as not found, as this happens regularly while they switch modes.
    fn open_first<F>(&self, accept: F) -> Result<Option<(UsbTransport<T>, DeviceInfo)>>
    where
        F: Fn(&DeviceInfo) -> bool,
    {
        let found = self
            .matching_devices()?
            .into_iter()
            .find(|(_, info)| accept(info));

        match found {
            Some((device, info)) => match UsbTransport::open(&device) {
                Ok(transport) => Ok(Some((transport, info))),
                Err(error) if error.is_transport() => {
                    debug!("Cannot open {}: {}", info, error);
                    Ok(None)
                }
                Err(error) => Err(error),
            },
            None => Ok(None),
        }
    }
}

impl<T: UsbContext> DeviceEnumerator for Context<T> {
    type Transport = UsbTransport<T>;
    type Application = UsbApplication<T>;

    fn find_bootloader(&mut self) -> Result<Option<Self::Transport>> {
        Ok(self
            .open_first(|info| info.mode == DeviceMode::Bootloader)?
            .map(|(transport, device)| {
                info!("Connected to {}", device);
                transport
            }))
    }

    fn find_application(
        &mut self,
        skip: &HashSet<(u8, u8)>,
    ) -> Result<Option<Self::Application>> {
        Ok(self
            .open_first(|info| {
                info.mode == DeviceMode::Application && !skip.contains(&info.location())
            })?
            .map(|(transport, info)| UsbApplication { transport, info }))
    }
}

/// A connected device running the fader application.
pub struct UsbApplication<T: UsbContext> {
    transport: UsbTransport<T>,
    info: DeviceInfo,
}

impl<T: UsbContext> UsbApplication<T> {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl<T: UsbContext> ApplicationDevice for UsbApplication<T> {
    fn location(&self) -> (u8, u8) {
        self.info.location()
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        info!("Requesting bootloader from {}", self.info);
        self.transport.write(&enter_bootloader_frame())
    }
}

/// Reads the descriptors of a device. Returns `None` for devices which are no faders at all.
fn identify<T: UsbContext>(device: &Device<T>, config: &DeviceConfig) -> Result<Option<DeviceInfo>> {
    let descriptor = device.device_descriptor()?;
    if descriptor.vendor_id() != config.vendor_id || descriptor.product_id() != config.product_id {
        return Ok(None);
    }

    // The vendor and product IDs are shared, so only the product string tells the modes apart
    let handle = device.open()?;
    let product = handle.read_product_string_ascii(&descriptor)?;
    let serial = handle.read_serial_number_string_ascii(&descriptor).ok();

    Ok(config.mode_of(&product).map(|mode| DeviceInfo {
        usb_bus_number: device.bus_number(),
        usb_bus_address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        product,
        serial,
        mode,
    }))
}
