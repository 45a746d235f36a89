//! Decoder for Intel HEX images, restricted to the record types of linear firmware images.

use crate::error::{Error, Result};
use crate::flash::AddressedBlock;
use log::{debug, trace};
use std::io::BufRead;
use std::iter::FusedIterator;

/// Characters in a record apart from the data bytes: start code, byte count, address, record
/// type and checksum.
const RECORD_OVERHEAD: usize = 11;

/// One past the highest address a data record may cover.
const ADDRESS_SPACE_END: u64 = 1 << 32;

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const START_SEGMENT_ADDRESS: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const START_LINEAR_ADDRESS: u8 = 0x05;

/// Lazily decodes hex records from a line source into addressed blocks, one per data record.
///
/// The sequence ends at the end of the input or at an end-of-file record, whichever comes first.
/// After the first error, the decoder yields nothing further.
///
/// Record checksums are parsed but not checked unless [`strict`] is enabled.
///
/// # Examples
///
/// ```rust
/// use faderboot::HexDecoder;
///
/// let image = ":020000040800F2\n:0400100001020304E2\n:00000001FF\n";
/// let blocks = HexDecoder::new(image.as_bytes())
///     .collect::<faderboot::Result<Vec<_>>>()
///     .unwrap();
/// assert_eq!(blocks.len(), 1);
/// assert_eq!(blocks[0].address(), 0x0800_0010);
/// assert_eq!(blocks[0].data(), &[1, 2, 3, 4]);
/// ```
///
/// [`strict`]: #method.strict
pub struct HexDecoder<R> {
    reader: R,
    line: usize,
    base_address: u32,
    strict: bool,
    done: bool,
}

impl<R: BufRead> HexDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            base_address: 0,
            strict: false,
            done: false,
        }
    }

    /// Enables or disables validation of the record checksums.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Decodes a single line. Returns a block for data records and `None` for everything else.
    fn decode_line(&mut self, text: &str) -> Result<Option<AddressedBlock>> {
        let line = self.line;
        let malformed = |reason| Error::MalformedRecord { line, reason };

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let chars = text.as_bytes();
        if chars[0] != b':' {
            return Err(malformed("missing start code"));
        }
        if chars.len() < 3 {
            return Err(malformed("record too short"));
        }

        let count = decode_hex(&chars[1..3]).ok_or_else(|| malformed("invalid hex digit"))?[0];
        if chars.len() != RECORD_OVERHEAD + 2 * count as usize {
            return Err(malformed("length does not match byte count"));
        }

        // count, address (2), type, data (count), checksum
        let record = decode_hex(&chars[1..]).ok_or_else(|| malformed("invalid hex digit"))?;
        let (body, checksum) = record.split_at(record.len() - 1);
        let checksum = checksum[0];
        let offset = u32::from(u16::from_be_bytes([body[1], body[2]]));
        let record_type = body[3];
        let data = &body[4..];

        if self.strict {
            let computed = body
                .iter()
                .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
                .wrapping_neg();
            if computed != checksum {
                return Err(Error::ChecksumMismatch {
                    line,
                    expected: checksum,
                    computed,
                });
            }
        }

        match record_type {
            DATA if data.is_empty() => Ok(None),
            DATA => {
                let address = self.base_address | offset;
                if u64::from(address) + data.len() as u64 > ADDRESS_SPACE_END {
                    return Err(malformed("data runs past the end of the address space"));
                }
                trace!("Line {}: {} bytes at 0x{:08x}", line, data.len(), address);
                Ok(Some(AddressedBlock::new(address, data.to_vec())))
            }
            END_OF_FILE => {
                self.done = true;
                Ok(None)
            }
            EXTENDED_SEGMENT_ADDRESS => Err(Error::UnsupportedRecordType { line, record_type }),
            START_SEGMENT_ADDRESS | START_LINEAR_ADDRESS => Ok(None),
            EXTENDED_LINEAR_ADDRESS => {
                if data.len() != 2 {
                    return Err(malformed("extended linear address needs two bytes"));
                }
                self.base_address = u32::from(u16::from_be_bytes([data[0], data[1]])) << 16;
                debug!("Base address set to 0x{:08x}", self.base_address);
                Ok(None)
            }
            _ => Err(malformed("unknown record type")),
        }
    }
}

impl<R: BufRead> Iterator for HexDecoder<R> {
    type Item = Result<AddressedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut raw = Vec::new();
            match self.reader.read_until(b'\n', &mut raw) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(error) => {
                    self.done = true;
                    return Some(Err(error.into()));
                }
            }
            self.line += 1;

            let decoded = match std::str::from_utf8(&raw) {
                Ok(text) if text.is_ascii() => self.decode_line(text),
                _ => Err(Error::MalformedRecord {
                    line: self.line,
                    reason: "non-ASCII character",
                }),
            };
            match decoded {
                Ok(Some(block)) => return Some(Ok(block)),
                Ok(None) => {}
                Err(error) => {
                    // Ensure that the iterator is fused after an error occurs
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
        None
    }
}

impl<R: BufRead> FusedIterator for HexDecoder<R> {}

/// Decodes pairs of hex digits into bytes. Fails on odd lengths and non-hex characters.
fn decode_hex(digits: &[u8]) -> Option<Vec<u8>> {
    fn nibble(digit: u8) -> Option<u8> {
        (digit as char).to_digit(16).map(|value| value as u8)
    }

    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(image: &str) -> Result<Vec<AddressedBlock>> {
        HexDecoder::new(image.as_bytes()).collect()
    }

    #[test]
    fn data_records() {
        let blocks = decode(":0400000001020304F2\n:02000400AABB95\n").unwrap();
        assert_eq!(
            blocks,
            vec![
                AddressedBlock::new(0, vec![1, 2, 3, 4]),
                AddressedBlock::new(4, vec![0xaa, 0xbb]),
            ]
        );
    }

    #[test]
    fn extended_linear_address_applies_to_following_records() {
        let blocks =
            decode(":0200000400FFFB\n:01001000AA45\n:020000040800F2\n:01002000BB24\n").unwrap();
        assert_eq!(blocks[0].address(), 0x00ff_0010);
        assert_eq!(blocks[1].address(), 0x0800_0020);
    }

    #[test]
    fn end_of_file_terminates() {
        let blocks = decode(":0100000011EE\n:00000001FF\n:0100010022DC\n").unwrap();
        assert_eq!(blocks, vec![AddressedBlock::new(0, vec![0x11])]);

        // Garbage after the end-of-file record is never looked at
        let blocks = decode(":00000001FF\nnot a record\n").unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn start_addresses_are_ignored() {
        let blocks = decode(":0400000300003800C1\n:04000005080000ED02\n:0100000011EE\n").unwrap();
        assert_eq!(blocks, vec![AddressedBlock::new(0, vec![0x11])]);
    }

    #[test]
    fn extended_segment_address_is_unsupported() {
        let error = decode(":0100000011EE\n:020000021200EA\n").unwrap_err();
        assert!(matches!(
            error,
            Error::UnsupportedRecordType {
                line: 2,
                record_type: 2
            }
        ));
    }

    #[test]
    fn unknown_record_type_is_malformed() {
        let error = decode(":00000006FA\n").unwrap_err();
        assert!(matches!(error, Error::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn malformed_lines() {
        for image in &[
            "0100000011EE",
            ":0",
            ":",
            ":0100000011",
            ":0100000011EE00",
            ":01000000GGEE",
            ":01000000+1EE",
            ":020000040800",
        ] {
            let error = decode(image).unwrap_err();
            assert!(
                matches!(error, Error::MalformedRecord { line: 1, .. }),
                "{:?} for {}",
                error,
                image
            );
        }
    }

    #[test]
    fn error_reports_line_number_and_fuses() {
        let mut decoder = HexDecoder::new(":0100000011EE\n\n:01000100\n:0100020033CA\n".as_bytes());
        assert!(decoder.next().unwrap().is_ok());
        assert!(matches!(
            decoder.next(),
            Some(Err(Error::MalformedRecord { line: 3, .. }))
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn checksums_are_only_checked_in_strict_mode() {
        let image = ":0100000011FF\r\n";
        assert_eq!(decode(image).unwrap().len(), 1);

        let error = HexDecoder::new(image.as_bytes())
            .strict(true)
            .collect::<Result<Vec<_>>>()
            .unwrap_err();
        assert!(matches!(
            error,
            Error::ChecksumMismatch {
                line: 1,
                expected: 0xff,
                computed: 0xee
            }
        ));

        let blocks = HexDecoder::new(":0100000011EE\n:020000040800F2\n".as_bytes())
            .strict(true)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn non_ascii_line_is_malformed() {
        let image: &[u8] = b":0100000011EE\n:01000100\xff\xfeDC\n";
        let mut decoder = HexDecoder::new(image);
        assert!(decoder.next().unwrap().is_ok());
        assert!(matches!(
            decoder.next(),
            Some(Err(Error::MalformedRecord { line: 2, .. }))
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn data_must_stay_within_the_address_space() {
        let blocks = decode(":02000004FFFFFC\n:04FFFC0001020304F7\n").unwrap();
        assert_eq!(blocks, vec![AddressedBlock::new(0xffff_fffc, vec![1, 2, 3, 4])]);

        let error = decode(":02000004FFFFFC\n:08FFFC000102030405060708D9\n").unwrap_err();
        assert!(matches!(error, Error::MalformedRecord { line: 2, .. }));
    }

    #[test]
    fn empty_data_records_yield_nothing() {
        assert!(decode(":00001000F0\n").unwrap().is_empty());
    }
}
