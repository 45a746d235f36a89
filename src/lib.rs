//! This crate provides a way to update the firmware of a Midi-Fader connected via USB. It decodes
//! Intel HEX images, splits them into flash pages and drives the device's bootloader protocol.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use faderboot::{Context, DeviceConfig, Discovery, ExitOutcome, Operation, Pager, PAGE_SIZE};
//! use std::fs::File;
//! use std::io::BufReader;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Decode the image and split it into pages before touching the device
//! let file = BufReader::new(File::open("fader.hex")?);
//! let pager = Pager::from_hex(file, PAGE_SIZE)?;
//! let vector = pager.start_address().unwrap_or(0);
//!
//! // Wait for a bootloader, kicking a running application into it if necessary
//! let context = Context::new(DeviceConfig::default())?;
//! let mut session = Discovery::new(context)
//!     .timeout(Some(Duration::from_secs(10)))
//!     .wait()?;
//!
//! // Synchronize with the bootloader and program every page
//! session.reset()?;
//! session.program_pages(pager).execute()?;
//!
//! // Start the application
//! match session.exit(vector)? {
//!     ExitOutcome::DeviceRebooted => println!("Done!"),
//!     ExitOutcome::UnexpectedResponse(_) => println!("Device did not restart"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! In addition to this very basic API, it also provides progress feedback while programming. See
//! the [`Operation`] trait for details.
//!
//! [`Operation`]: trait.Operation.html

mod context;
mod device;
mod discovery;
mod error;
mod flash;
mod frame;
mod hex;
mod operation;
mod session;
mod transport;

pub use context::{Context, UsbApplication};
pub use device::{DeviceConfig, DeviceInfo, DeviceMode};
pub use discovery::{DeviceEnumerator, Discovery};
pub use error::{Error, Result};
pub use flash::{AddressedBlock, Pager, SubBlock, PAGE_SIZE, SECTOR_SIZE, SUB_BLOCK_SIZE};
pub use frame::{crc32, Command, StatusFrame, FRAME_SIZE};
pub use hex::HexDecoder;
pub use operation::{Operation, Program};
pub use rusb::UsbContext;
pub use session::{BootloaderSession, ExitOutcome, SessionState};
pub use transport::{ApplicationDevice, Transport, UsbTransport};

/// How often the reset command is repeated to flush a half-received command on the device.
const RESET_REPEAT: usize = 3;

/// Number of reads attempted after a reset to drain stale status frames.
const RESET_DRAIN_ATTEMPTS: usize = 3;

/// Timeout for each of the reads draining stale status frames.
const RESET_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// Default delay between two discovery polls.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
