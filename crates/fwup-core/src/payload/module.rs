//! Firmware module and block descriptors.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::crc::{crc_aligned, crc32};
use crate::protocol::constants::PAGE_SIZE;

/// One fixed-size chunk of a module's aligned payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareBlock {
    /// Byte offset within the module.
    pub offset: usize,
    /// Share of the page aligned buffer this block spans.
    pub size: usize,
    /// Bytes sent to the device and covered by `crc`. Equals `size` except
    /// where the block reaches into page padding.
    pub crc_len: usize,
    /// CRC seeded with the block index.
    pub crc: u32,
}

impl FirmwareBlock {
    /// The bytes of `payload` sent for this block.
    pub fn data<'a>(&self, payload: &'a [u8]) -> Option<&'a [u8]> {
        payload.get(self.offset..self.offset + self.crc_len)
    }
}

/// A module parsed out of a firmware container. Read-only after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareModule {
    pub name: String,
    pub version: String,
    /// Whole-module CRC, as declared by the directory and verified on parse.
    pub crc: u32,
    pub source_file: PathBuf,
    /// Offset of the payload in `source_file`.
    pub file_offset: u64,
    /// Payload size as declared by the directory entry.
    pub size: usize,
    /// `size` rounded up to a page.
    pub aligned_size: usize,
    pub blocks: Vec<FirmwareBlock>,
}

impl FirmwareModule {
    /// Re-read the payload from the source file into a zero padded buffer of
    /// `aligned_size` bytes.
    pub fn load_payload(&self) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.source_file)?;
        file.seek(SeekFrom::Start(self.file_offset))?;
        let mut buffer = vec![0u8; self.aligned_size];
        file.read_exact(&mut buffer[..self.size])?;
        Ok(buffer)
    }

    /// Block CRCs in index order, little-endian, as sent to the device.
    pub fn block_crc_table(&self) -> Vec<u8> {
        self.blocks
            .iter()
            .flat_map(|block| block.crc.to_le_bytes())
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Geometry of one block before its CRC is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub offset: usize,
    pub size: usize,
    /// Bytes covered by the block CRC; shorter than `size` only when the
    /// block reaches into page padding.
    pub crc_len: usize,
}

/// Round a payload size up to a whole page.
pub const fn page_aligned(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Split a module of `size` bytes into blocks of `block_size`.
///
/// Blocks cover the page aligned buffer; the CRC byte budget is the
/// 4-byte aligned payload size and is drawn down block by block.
pub fn block_layout(size: usize, block_size: usize) -> Vec<BlockSpan> {
    let aligned = page_aligned(size);
    let mut crc_remaining = crc_aligned(size);
    let mut spans = Vec::with_capacity(aligned.div_ceil(block_size));

    let mut offset = 0;
    while offset < aligned {
        let block_len = block_size.min(aligned - offset);
        let crc_len = block_len.min(crc_remaining);
        crc_remaining -= crc_len;
        spans.push(BlockSpan {
            offset,
            size: block_len,
            crc_len,
        });
        offset += block_len;
    }
    spans
}

/// Compute the blocks of an aligned module buffer.
pub fn segment(buffer: &[u8], size: usize, block_size: usize) -> Vec<FirmwareBlock> {
    block_layout(size, block_size)
        .into_iter()
        .enumerate()
        .map(|(index, span)| FirmwareBlock {
            offset: span.offset,
            size: span.size,
            crc_len: span.crc_len,
            crc: crc32(
                index as u32,
                &buffer[span.offset..span.offset + span.crc_len],
            ),
        })
        .collect()
}
