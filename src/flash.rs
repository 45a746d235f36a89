use crate::error::{Error, Result};
use crate::hex::HexDecoder;
use log::{debug, warn};
use std::collections::VecDeque;
use std::io::BufRead;
use std::iter::FusedIterator;

/// Programming granularity of the bootloader.
pub const PAGE_SIZE: u32 = 128;

/// Erase granularity of the target microcontroller's flash.
pub const SECTOR_SIZE: u32 = 1024;

/// Size of one half page, which is transferred as a single frame.
pub const SUB_BLOCK_SIZE: usize = 64;

/// One past the highest address a block may cover.
const ADDRESS_SPACE_END: u64 = 1 << 32;

/// A run of bytes placed at an address in the flat 32 bit address space.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressedBlock {
    address: u32,
    data: Vec<u8>,
}

impl AddressedBlock {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// The address of the first byte.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The address one past the last byte. Wider than an address so that a block ending at the
    /// top of the address space can be represented.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }

    /// Whether the block is exactly one page of the given size, aligned to it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use faderboot::{AddressedBlock, PAGE_SIZE};
    ///
    /// assert!(AddressedBlock::new(0x0800_0080, vec![0; 128]).is_page(PAGE_SIZE));
    /// assert!(!AddressedBlock::new(0x0800_0040, vec![0; 128]).is_page(PAGE_SIZE));
    /// assert!(!AddressedBlock::new(0x0800_0080, vec![0; 64]).is_page(PAGE_SIZE));
    /// ```
    pub fn is_page(&self, page_size: u32) -> bool {
        page_size.is_power_of_two()
            && self.data.len() == page_size as usize
            && self.address & (page_size - 1) == 0
    }

    /// Splits the block into its lower and upper half.
    pub fn halves(&self) -> (SubBlock<'_>, SubBlock<'_>) {
        let (lower, upper) = self.data.split_at(self.data.len() / 2);
        (
            SubBlock {
                address: self.address,
                data: lower,
            },
            SubBlock {
                address: self.address + lower.len() as u32,
                data: upper,
            },
        )
    }

    /// Copies another block over this one. The other block must not start below this one; the
    /// data is extended with zeros as needed.
    fn overlay(&mut self, other: AddressedBlock) {
        let offset = (other.address - self.address) as usize;
        let end = offset + other.data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(&other.data);
    }

    /// Drops the first `count` bytes, moving the start address accordingly.
    fn advance(&mut self, count: usize) {
        self.address += count as u32;
        self.data.drain(..count);
    }
}

/// A read-only view of one half of a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubBlock<'a> {
    address: u32,
    data: &'a [u8],
}

impl<'a> SubBlock<'a> {
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Re-chunks arbitrary, possibly sparse blocks into zero-padded, page-aligned pages.
///
/// The pages cover the smallest page-aligned range spanning all input data, in ascending order.
/// Pages in gaps between the input blocks are produced as well, filled with zeros.
///
/// # Examples
///
/// ```rust
/// use faderboot::{AddressedBlock, Pager};
///
/// let blocks = vec![
///     AddressedBlock::new(0x104, vec![0xaa; 4]),
///     AddressedBlock::new(0x0f8, vec![0xbb; 8]),
/// ];
/// let pages: Vec<_> = Pager::new(blocks, 128).unwrap().collect();
///
/// assert_eq!(pages.len(), 2);
/// assert_eq!(pages[0].address(), 0x080);
/// assert_eq!(&pages[0].data()[0x78..], &[0xbb; 8]);
/// assert_eq!(pages[1].address(), 0x100);
/// assert_eq!(&pages[1].data()[..8], &[0, 0, 0, 0, 0xaa, 0xaa, 0xaa, 0xaa]);
/// ```
#[derive(Debug)]
pub struct Pager {
    /// Disjoint segments sorted by address, none of them below `next_address`.
    segments: VecDeque<AddressedBlock>,
    page_size: u32,
    next_address: u64,
    end_address: u64,
}

impl Pager {
    /// Sorts and merges the blocks. Fails if the page size is not a power of two.
    pub fn new<I>(blocks: I, page_size: u32) -> Result<Self>
    where
        I: IntoIterator<Item = AddressedBlock>,
    {
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidPageSize(page_size));
        }
        let mask = u64::from(page_size) - 1;

        let segments = merge(blocks.into_iter().collect());
        let (next_address, end_address) = match (segments.front(), segments.back()) {
            (Some(first), Some(last)) => (
                u64::from(first.address) & !mask,
                (last.end() + mask) & !mask,
            ),
            _ => (0, 0),
        };
        debug!(
            "{} segments spanning 0x{:08x}..0x{:08x}",
            segments.len(),
            next_address,
            end_address
        );

        Ok(Self {
            segments,
            page_size,
            next_address,
            end_address,
        })
    }

    /// Decodes a complete hex image and pages it. Fails on the first decoding error.
    pub fn from_hex<R: BufRead>(reader: R, page_size: u32) -> Result<Self> {
        let blocks = HexDecoder::new(reader).collect::<Result<Vec<_>>>()?;
        Self::new(blocks, page_size)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Address of the next page to be produced, if there is one.
    pub fn start_address(&self) -> Option<u32> {
        if self.next_address < self.end_address {
            Some(self.next_address as u32)
        } else {
            None
        }
    }
}

impl Iterator for Pager {
    type Item = AddressedBlock;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_address >= self.end_address {
            return None;
        }

        let page_size = self.page_size as usize;
        let base = self.next_address;
        let page_end = base + page_size as u64;
        let mut data = vec![0u8; page_size];

        while let Some(segment) = self.segments.front_mut() {
            let start = u64::from(segment.address);
            if start >= page_end {
                break;
            }

            let offset = (start - base) as usize;
            let count = segment.len().min(page_size - offset);
            data[offset..offset + count].copy_from_slice(&segment.data[..count]);

            if count < segment.len() {
                // The segment reaches into the next page
                segment.advance(count);
                break;
            }
            self.segments.pop_front();
        }

        self.next_address = page_end;
        Some(AddressedBlock::new(base as u32, data))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = ((self.end_address - self.next_address) / u64::from(self.page_size)) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Pager {}

impl FusedIterator for Pager {}

/// Sorts blocks by address and coalesces contiguous or overlapping ones into segments. Where
/// blocks overlap, the one appearing later in the input wins, whatever its address. Data beyond
/// the 32 bit address space is dropped.
fn merge(blocks: Vec<AddressedBlock>) -> VecDeque<AddressedBlock> {
    let mut blocks: Vec<(usize, AddressedBlock)> = blocks
        .into_iter()
        .map(clip_to_address_space)
        .enumerate()
        .filter(|(_, block)| !block.is_empty())
        .collect();
    blocks.sort_by_key(|(_, block)| block.address);

    let mut segments = VecDeque::new();
    let mut cluster: Vec<(usize, AddressedBlock)> = Vec::new();
    let mut cluster_end = 0;
    for (index, block) in blocks {
        if !cluster.is_empty() && u64::from(block.address) > cluster_end {
            segments.push_back(paint(&mut cluster));
        }
        cluster_end = if cluster.is_empty() {
            block.end()
        } else {
            cluster_end.max(block.end())
        };
        cluster.push((index, block));
    }
    if !cluster.is_empty() {
        segments.push_back(paint(&mut cluster));
    }
    segments
}

/// Combines an address-sorted cluster of connected blocks into one segment, copying them over
/// each other in input order.
fn paint(cluster: &mut Vec<(usize, AddressedBlock)>) -> AddressedBlock {
    let mut segment = AddressedBlock::new(cluster[0].1.address, Vec::new());
    cluster.sort_by_key(|(index, _)| *index);
    for (_, block) in cluster.drain(..) {
        segment.overlay(block);
    }
    segment
}

fn clip_to_address_space(mut block: AddressedBlock) -> AddressedBlock {
    if block.end() > ADDRESS_SPACE_END {
        warn!(
            "Dropping {} bytes beyond the end of the address space",
            block.end() - ADDRESS_SPACE_END
        );
        block
            .data
            .truncate((ADDRESS_SPACE_END - u64::from(block.address)) as usize);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(blocks: Vec<AddressedBlock>, page_size: u32) -> Vec<AddressedBlock> {
        Pager::new(blocks, page_size).unwrap().collect()
    }

    /// Deterministic, sparse test image: blocks of varying length with gaps of varying size.
    fn sparse_image() -> Vec<AddressedBlock> {
        let mut seed: u32 = 0x1234_5678;
        let mut next = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            seed >> 16
        };

        let mut blocks = Vec::new();
        let mut address = 0x0800_0013;
        for _ in 0..40 {
            let length = 1 + (next() % 40) as usize;
            let data = (0..length).map(|_| next() as u8).collect();
            blocks.push(AddressedBlock::new(address, data));
            address += length as u32;
            if next() % 3 == 0 {
                address += next() % 700;
            }
        }
        blocks.reverse();
        blocks
    }

    #[test]
    fn contiguous_blocks_of_different_length_merge() {
        let segments = merge(vec![
            AddressedBlock::new(0x10, vec![3; 5]),
            AddressedBlock::new(0x00, vec![1; 16]),
            AddressedBlock::new(0x15, vec![4; 1]),
        ]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address(), 0);
        assert_eq!(segments[0].len(), 0x16);
    }

    #[test]
    fn equal_length_blocks_with_gap_do_not_merge() {
        let segments = merge(vec![
            AddressedBlock::new(0x00, vec![1; 16]),
            AddressedBlock::new(0x20, vec![2; 16]),
        ]);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn later_block_wins_on_overlap() {
        let segments = merge(vec![
            AddressedBlock::new(0x00, vec![1; 8]),
            AddressedBlock::new(0x04, vec![2; 8]),
        ]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data(), &[1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn later_block_wins_even_at_lower_address() {
        let segments = merge(vec![
            AddressedBlock::new(0x04, vec![1; 8]),
            AddressedBlock::new(0x00, vec![2; 8]),
        ]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address(), 0);
        assert_eq!(segments[0].data(), &[2, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn overlap_order_follows_input_across_a_cluster() {
        // The middle block bridges the other two and is overwritten by both
        let segments = merge(vec![
            AddressedBlock::new(0x02, vec![3; 6]),
            AddressedBlock::new(0x00, vec![1; 4]),
            AddressedBlock::new(0x06, vec![2; 4]),
        ]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data(), &[1, 1, 1, 1, 3, 3, 2, 2, 2, 2]);
    }

    #[test]
    fn data_past_the_address_space_is_dropped() {
        let result = pages(vec![AddressedBlock::new(0xffff_fffc, (1..=8).collect())], 128);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address(), 0xffff_ff80);
        assert_eq!(&result[0].data()[0x7c..], &[1, 2, 3, 4]);
    }

    #[test]
    fn single_unaligned_block_is_padded() {
        let result = pages(vec![AddressedBlock::new(0x0800_0084, vec![0xff; 4])], 128);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address(), 0x0800_0080);
        assert_eq!(&result[0].data()[..4], &[0; 4]);
        assert_eq!(&result[0].data()[4..8], &[0xff; 4]);
        assert!(result[0].data()[8..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn gap_inside_page_is_zero_filled() {
        let result = pages(
            vec![
                AddressedBlock::new(0x00, vec![1; 4]),
                AddressedBlock::new(0x10, vec![2; 4]),
            ],
            32,
        );
        assert_eq!(result.len(), 1);
        let mut expected = vec![0u8; 32];
        expected[..4].copy_from_slice(&[1; 4]);
        expected[0x10..0x14].copy_from_slice(&[2; 4]);
        assert_eq!(result[0].data(), expected.as_slice());
    }

    #[test]
    fn empty_pages_in_gaps_are_produced() {
        let result = pages(
            vec![
                AddressedBlock::new(0x000, vec![1; 4]),
                AddressedBlock::new(0x200, vec![2; 4]),
            ],
            128,
        );
        assert_eq!(result.len(), 5);
        for (index, page) in result.iter().enumerate() {
            assert_eq!(page.address(), index as u32 * 128);
        }
        assert!(result[1..4]
            .iter()
            .all(|page| page.data().iter().all(|&byte| byte == 0)));
    }

    #[test]
    fn large_segment_spans_pages() {
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let result = pages(vec![AddressedBlock::new(0x40, data.clone())], 128);
        assert_eq!(result.len(), 3);
        assert_eq!(&result[0].data()[0x40..], &data[..0x40]);
        assert_eq!(result[1].data(), &data[0x40..0xc0]);
        assert_eq!(&result[2].data()[..0x6c], &data[0xc0..]);
        assert!(result[2].data()[0x6c..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn block_at_top_of_address_space() {
        let result = pages(vec![AddressedBlock::new(0xffff_fffc, vec![7; 4])], 128);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address(), 0xffff_ff80);
        assert_eq!(&result[0].data()[0x7c..], &[7; 4]);
    }

    #[test]
    fn no_input_no_pages() {
        let mut pager = Pager::new(Vec::new(), 128).unwrap();
        assert_eq!(pager.start_address(), None);
        assert_eq!(pager.len(), 0);
        assert!(pager.next().is_none());
    }

    #[test]
    fn page_size_must_be_a_power_of_two() {
        assert!(matches!(
            Pager::new(Vec::new(), 0),
            Err(Error::InvalidPageSize(0))
        ));
        assert!(matches!(
            Pager::new(Vec::new(), 96),
            Err(Error::InvalidPageSize(96))
        ));
    }

    #[test]
    fn pages_are_aligned_and_full_for_all_page_sizes() {
        for shift in 0..12 {
            let page_size = 1u32 << shift;
            let pager = Pager::new(sparse_image(), page_size).unwrap();
            let expected = pager.len();
            let result: Vec<_> = pager.collect();
            assert_eq!(result.len(), expected);
            for page in &result {
                assert!(page.is_page(page_size), "page size {}", page_size);
            }
            for pair in result.windows(2) {
                assert_eq!(pair[0].address() + page_size, pair[1].address());
            }
        }
    }

    #[test]
    fn pages_reproduce_input() {
        let image = sparse_image();
        let first = image.iter().map(|block| block.address()).min().unwrap();
        let last = image.iter().map(|block| block.end()).max().unwrap();

        let result = pages(image.clone(), 128);
        assert_eq!(result[0].address(), first & !127);
        assert_eq!(
            result.len() as u64,
            ((last + 127) & !127) / 128 - u64::from(first / 128)
        );

        let base = result[0].address();
        let flat: Vec<u8> = result.iter().flat_map(|page| page.data().to_vec()).collect();
        for block in &image {
            let offset = (block.address() - base) as usize;
            assert_eq!(&flat[offset..offset + block.len()], block.data());
        }
    }

    #[test]
    fn halves_of_a_page() {
        let data: Vec<u8> = (0..128).collect();
        let page = AddressedBlock::new(0x0800_0100, data.clone());
        let (lower, upper) = page.halves();
        assert_eq!(lower.address(), 0x0800_0100);
        assert_eq!(lower.data(), &data[..64]);
        assert_eq!(upper.address(), 0x0800_0140);
        assert_eq!(upper.data(), &data[64..]);
    }

    #[test]
    fn pager_from_hex() {
        let image = ":020000040800F2\n:0400100001020304E2\n:00000001FF\n";
        let mut pager = Pager::from_hex(image.as_bytes(), PAGE_SIZE).unwrap();
        assert_eq!(pager.start_address(), Some(0x0800_0000));
        let page = pager.next().unwrap();
        assert_eq!(&page.data()[0x10..0x14], &[1, 2, 3, 4]);
        assert!(pager.next().is_none());
    }
}
