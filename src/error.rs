use std::result::Result as StdResult;
use std::time::Duration;
use thiserror::Error;

/// Errors which can occur while decoding an image and during device communication.
#[derive(Debug, Error)]
pub enum Error {
    /// A line of the hex input does not follow the record syntax.
    #[error("Malformed record in line {line}: {reason}")]
    MalformedRecord {
        /// Line number, counting from 1.
        line: usize,

        /// What is wrong with the record.
        reason: &'static str,
    },

    /// The hex input uses a record type which cannot be expressed in a linear image (extended
    /// segment addresses).
    #[error("Unsupported record type 0x{record_type:02X} in line {line}")]
    UnsupportedRecordType { line: usize, record_type: u8 },

    /// A record's checksum does not match its contents. Only reported in strict mode.
    #[error("Checksum mismatch in line {line}: expected 0x{expected:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch {
        line: usize,
        expected: u8,
        computed: u8,
    },

    /// Page sizes have to be a non-zero power of two.
    #[error("Invalid page size {0}")]
    InvalidPageSize(u32),

    /// A block handed to the bootloader is not a 128 byte, 128 byte aligned page.
    #[error("Invalid page: {length} bytes at 0x{address:08X}")]
    InvalidPage { address: u32, length: usize },

    /// The device reported a nonzero status flag. The code is passed on unaltered.
    #[error("Device reported error {0}")]
    DeviceError(i32),

    /// A status frame of the wrong size was received.
    #[error("Malformed response of {0} bytes")]
    MalformedResponse(usize),

    /// No bootloader showed up within the allotted time.
    #[error("No bootloader found within {0:?}")]
    DiscoveryTimeout(Duration),

    /// A bounded read did not complete in time.
    #[error("Communication timeout")]
    Timeout,

    /// The session has already exited or aborted and no longer accepts commands.
    #[error("Bootloader session is closed")]
    SessionClosed,

    /// Reading the hex input failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred during the raw USB communication.
    #[error("USB error: {0}")]
    Usb(rusb::Error),
}

impl Error {
    /// Whether the error is a failure of the communication channel itself rather than a
    /// complaint about its contents.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Usb(_) | Error::Io(_) | Error::Timeout)
    }
}

impl From<rusb::Error> for Error {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Timeout => Error::Timeout,
            error => Error::Usb(error),
        }
    }
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
