//! Wire format of the bootloader protocol. Every frame is 64 bytes; integers are little-endian.

use crate::error::{Error, Result};
use crate::flash::{AddressedBlock, SubBlock};
use crc_any::CRC;
use std::fmt;

/// Size of every frame exchanged with the device, in either direction.
pub const FRAME_SIZE: usize = 64;

/// Opcode the application firmware accepts as a request to restart into the bootloader.
const ENTER_BOOTLOADER: u32 = 0x0000_00b0;

/// Splits the first four bytes of a slice off and interprets them as a little-endian u32.
fn read_le_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(int_bytes);
    u32::from_le_bytes(bytes)
}

/// Builds a frame from an opcode and up to 60 bytes of payload, zero-padding the rest.
fn frame(opcode: u32, payload: &[u8]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[..4].copy_from_slice(&opcode.to_le_bytes());
    frame[4..4 + payload.len()].copy_from_slice(payload);
    frame
}

/// Commands understood by the bootloader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// Flushes a partially received command.
    Reset,

    /// Erases the sector containing the address.
    Erase { address: u32 },

    /// Announces a page, with the checksums of both halves so the device can check the data
    /// before it is transferred.
    ProgramStart {
        address: u32,
        crc_lower: u32,
        crc_upper: u32,
    },

    /// Leaves the bootloader and starts the application whose vector table is at `vector`.
    Exit { vector: u32 },

    /// Leaves the bootloader without starting anything.
    Abort,
}

impl Command {
    /// The announcement for a page, carrying the checksums of its two halves.
    pub fn program_start(page: &AddressedBlock) -> Self {
        let (lower, upper) = page.halves();
        Command::ProgramStart {
            address: lower.address(),
            crc_lower: crc32(lower.data()),
            crc_upper: crc32(upper.data()),
        }
    }

    pub fn opcode(&self) -> u32 {
        match self {
            Command::Reset => 0x0000_0000,
            Command::Erase { .. } => 0x0000_0088,
            Command::ProgramStart { .. } => 0x0000_0080,
            Command::Exit { .. } => 0x0000_00c3,
            Command::Abort => 0x0000_003e,
        }
    }

    /// Serializes the command into a complete frame.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        match *self {
            Command::Reset | Command::Abort => frame(self.opcode(), &[]),
            Command::Erase { address } => frame(self.opcode(), &address.to_le_bytes()),
            Command::ProgramStart {
                address,
                crc_lower,
                crc_upper,
            } => {
                let mut payload = [0u8; 12];
                payload[0..4].copy_from_slice(&address.to_le_bytes());
                payload[4..8].copy_from_slice(&crc_lower.to_le_bytes());
                payload[8..12].copy_from_slice(&crc_upper.to_le_bytes());
                frame(self.opcode(), &payload)
            }
            Command::Exit { vector } => frame(self.opcode(), &vector.to_le_bytes()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Reset => write!(f, "reset"),
            Command::Erase { address } => write!(f, "erase 0x{:08x}", address),
            Command::ProgramStart { address, .. } => write!(f, "program 0x{:08x}", address),
            Command::Exit { vector } => write!(f, "exit to 0x{:08x}", vector),
            Command::Abort => write!(f, "abort"),
        }
    }
}

/// A half page sent as is, without any opcode.
pub(crate) fn data_frame(block: SubBlock<'_>) -> Result<[u8; FRAME_SIZE]> {
    <[u8; FRAME_SIZE]>::try_from(block.data()).map_err(|_| Error::InvalidPage {
        address: block.address(),
        length: block.data().len(),
    })
}

/// The request making an application-mode device restart into its bootloader.
pub(crate) fn enter_bootloader_frame() -> [u8; FRAME_SIZE] {
    frame(ENTER_BOOTLOADER, &[])
}

/// Status the bootloader reports after each command and data frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusFrame {
    /// Opcode of the command this status refers to.
    pub last_command: u32,

    /// Zero on success, otherwise a device specific error code.
    pub flags: i32,

    /// CRC32 of the lower half page as the device computed it.
    pub crc32_lower: u32,

    /// CRC32 of the upper half page as the device computed it.
    pub crc32_upper: u32,

    pub reserved: [u8; 48],
}

impl StatusFrame {
    pub fn new(last_command: u32, flags: i32) -> Self {
        Self {
            last_command,
            flags,
            crc32_lower: 0,
            crc32_upper: 0,
            reserved: [0; 48],
        }
    }

    /// Turns a nonzero status flag into an error.
    pub fn check(&self) -> Result<()> {
        match self.flags {
            0 => Ok(()),
            code => Err(Error::DeviceError(code)),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0..4].copy_from_slice(&self.last_command.to_le_bytes());
        frame[4..8].copy_from_slice(&self.flags.to_le_bytes());
        frame[8..12].copy_from_slice(&self.crc32_lower.to_le_bytes());
        frame[12..16].copy_from_slice(&self.crc32_upper.to_le_bytes());
        frame[16..].copy_from_slice(&self.reserved);
        frame
    }
}

impl TryFrom<&[u8]> for StatusFrame {
    type Error = Error;

    fn try_from(mut packet: &[u8]) -> Result<Self> {
        if packet.len() != FRAME_SIZE {
            return Err(Error::MalformedResponse(packet.len()));
        }

        let last_command = read_le_u32(&mut packet);
        let flags = read_le_u32(&mut packet) as i32;
        let crc32_lower = read_le_u32(&mut packet);
        let crc32_upper = read_le_u32(&mut packet);
        let mut reserved = [0u8; 48];
        reserved.copy_from_slice(packet);

        Ok(StatusFrame {
            last_command,
            flags,
            crc32_lower,
            crc32_upper,
            reserved,
        })
    }
}

/// Calculates the standard (IEEE 802.3) CRC32 of a byte buffer, as the bootloader does.
pub fn crc32(buff: &[u8]) -> u32 {
    let mut crc = CRC::crc32();
    crc.digest(buff);
    crc.get_crc() as u32
}
