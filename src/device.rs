//! Contains data structures describing the devices found on the bus.

use std::fmt;

/// Which firmware a device is currently running, told apart by its product string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceMode {
    /// The regular fader firmware. Accepts a request to restart into the bootloader.
    Application,

    /// The bootloader. Accepts the programming commands.
    Bootloader,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Application => f.write_str("application"),
            DeviceMode::Bootloader => f.write_str("bootloader"),
        }
    }
}

/// Selects the devices to talk to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    /// USB vendor ID shared by both firmware personalities.
    pub vendor_id: u16,

    /// USB product ID shared by both firmware personalities.
    pub product_id: u16,

    /// Product string reported by the bootloader.
    pub bootloader_product: String,

    /// Product string reported by the application firmware.
    pub application_product: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x16c0,
            product_id: 0x05df,
            bootloader_product: "Midi-Fader Bootloader".to_string(),
            application_product: "Midi-Fader".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Classifies a device by its product string. Returns `None` for unrelated devices.
    pub fn mode_of(&self, product: &str) -> Option<DeviceMode> {
        if product == self.bootloader_product {
            Some(DeviceMode::Bootloader)
        } else if product == self.application_product {
            Some(DeviceMode::Application)
        } else {
            None
        }
    }
}

/// Information about a matching device, read from its USB descriptors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    /// USB bus ID the device is connected to.
    pub usb_bus_number: u8,

    /// USB device address of the device.
    pub usb_bus_address: u8,

    pub vendor_id: u16,

    pub product_id: u16,

    /// Product string the device reported via its USB descriptor.
    pub product: String,

    /// Serial number string, if the device has one.
    pub serial: Option<String>,

    pub mode: DeviceMode,
}

impl DeviceInfo {
    /// USB bus number and device address.
    pub fn location(&self) -> (u8, u8) {
        (self.usb_bus_number, self.usb_bus_address)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} {} ({}",
            self.usb_bus_number,
            self.usb_bus_address,
            self.vendor_id,
            self.product_id,
            self.product,
            self.mode
        )?;
        if let Some(serial) = &self.serial {
            write!(f, ", serial {}", serial)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_by_product_string() {
        let config = DeviceConfig::default();
        assert_eq!(
            config.mode_of("Midi-Fader Bootloader"),
            Some(DeviceMode::Bootloader)
        );
        assert_eq!(config.mode_of("Midi-Fader"), Some(DeviceMode::Application));
        assert_eq!(config.mode_of("Midi-Fader 2"), None);
    }

    #[test]
    fn display() {
        let mut info = DeviceInfo {
            usb_bus_number: 1,
            usb_bus_address: 12,
            vendor_id: 0x16c0,
            product_id: 0x05df,
            product: "Midi-Fader".to_string(),
            serial: None,
            mode: DeviceMode::Application,
        };
        assert_eq!(
            info.to_string(),
            "Bus 001 Device 012: ID 16c0:05df Midi-Fader (application)"
        );

        info.serial = Some("0042".to_string());
        assert!(info.to_string().ends_with("(application, serial 0042)"));
    }
}
