//! Block reconciliation.
//!
//! Compares the block CRCs computed from the image with the block table the
//! device prints for `dlinfo <name>`:
//!
//! ```text
//! dlinfo ack
//! OPFW is active-updating
//! OPFW info
//! total 2921060, blkSz 524288
//! blk  state HDR CRC  Real CRC
//! #0   OK    b9fa1f11 b9fa1f11
//! #1   OK    fae50cb5 fae50cb5
//! OPFW end
//! SCRAP info
//! ...
//! SCRAP end
//! dlinfo end
//! ```
//!
//! Every block needs transfer until the device proves otherwise.

use std::fmt;

use tracing::debug;

use crate::payload::FirmwareModule;
use crate::protocol::constants::{MARKER_DLINFO_END, SCRAP};

/// Per-block status token of a block table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    Other(String),
}

impl BlockStatus {
    pub fn parse(token: &str) -> Self {
        match token {
            "OK" => BlockStatus::Ok,
            other => BlockStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Ok => write!(f, "OK"),
            BlockStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One `#index status hdrCRC realCRC` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub index: usize,
    pub status: BlockStatus,
    /// CRC the device was told when the block was written.
    pub hdr_crc: u32,
    /// CRC the device computed over what it stored.
    pub real_crc: u32,
}

impl BlockRecord {
    /// Parse a record line. The record may follow a log prefix; anything
    /// without the record shape yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = &line[line.find('#')? + 1..];
        let mut fields = rest.split_whitespace();
        let index = fields.next()?.parse().ok()?;
        let status = BlockStatus::parse(fields.next()?);
        let hdr_crc = u32::from_str_radix(fields.next()?, 16).ok()?;
        let real_crc = u32::from_str_radix(fields.next()?, 16).ok()?;
        Some(Self {
            index,
            status,
            hdr_crc,
            real_crc,
        })
    }

    /// Status is OK and both device CRCs equal `expected`.
    pub fn is_verified(&self, expected: u32) -> bool {
        self.status == BlockStatus::Ok && self.hdr_crc == self.real_crc && self.hdr_crc == expected
    }
}

/// Iterator over the block records of a `dlinfo` response.
///
/// Reads the bookkeeping module's section when the response has one,
/// otherwise the whole response. Ends at the section terminator.
pub struct BlockRecords<'a> {
    lines: std::str::Lines<'a>,
    terminator: String,
    done: bool,
}

impl<'a> BlockRecords<'a> {
    pub fn new(report: &'a str) -> Self {
        let section = format!("{} info", SCRAP);
        match report.find(&section) {
            Some(start) => Self {
                lines: report[start..].lines(),
                terminator: format!("{} end", SCRAP),
                done: false,
            },
            None => Self {
                lines: report.lines(),
                terminator: MARKER_DLINFO_END.to_string(),
                done: false,
            },
        }
    }
}

impl Iterator for BlockRecords<'_> {
    type Item = BlockRecord;

    fn next(&mut self) -> Option<BlockRecord> {
        while !self.done {
            let Some(line) = self.lines.next() else {
                self.done = true;
                break;
            };
            if line.contains(self.terminator.as_str()) {
                self.done = true;
                break;
            }
            if let Some(record) = BlockRecord::parse(line) {
                return Some(record);
            }
        }
        None
    }
}

/// Per-block transfer decision, indexed like the module's blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan(Vec<bool>);

impl BlockPlan {
    /// Every block needs transfer.
    pub fn all(count: usize) -> Self {
        Self(vec![true; count])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_pending(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.0.iter().filter(|&&pending| pending).count()
    }

    pub fn is_complete(&self) -> bool {
        self.pending_count() == 0
    }

    /// Indices that need transfer, ascending.
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, &pending)| pending.then_some(i))
    }
}

/// Decide which blocks of `module` need transfer given the device `report`.
pub fn plan_blocks(module: &FirmwareModule, report: &str, force_full: bool) -> BlockPlan {
    let count = module.blocks.len();

    if force_full || report.contains("empty") {
        debug!(module = %module.name, "Force update of all blocks");
        return BlockPlan::all(count);
    }

    let mut flags = vec![true; count];
    for record in BlockRecords::new(report) {
        let Some(block) = module.blocks.get(record.index) else {
            debug!(
                module = %module.name,
                index = record.index,
                "Block not found in image, updating all blocks"
            );
            return BlockPlan::all(count);
        };
        let update = !record.is_verified(block.crc);
        debug!(
            "Block #{}: fw: {} 0x{:08x} 0x{:08x}, local: 0x{:08x}, {}",
            record.index,
            record.status,
            record.hdr_crc,
            record.real_crc,
            block.crc,
            if update { "update" } else { "keep" }
        );
        flags[record.index] = update;
    }
    BlockPlan(flags)
}
