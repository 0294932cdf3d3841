//! Protocol constants for the F45x firmware update flow.
//!
//! Covers the container (UFIF) byte layout, the allowed module set and the
//! markers and timeouts of the device's text protocol.

use std::time::Duration;

// ============================================================================
// Container Layout
// ============================================================================

/// Container signature ("UFHF" little-endian).
pub const UFIF_SIGNATURE: u32 = 0x4648_4655;
/// Container format version; only the major (high) byte is checked.
pub const UFIF_VERSION: u16 = 0x0100;
/// Modules are packed at this byte alignment.
pub const UFIF_ALIGN: u64 = 16;
/// Fixed length of a directory entry's name field.
pub const UFIF_NAME_MAX: usize = 64;

/// Size of the container file header.
pub const FILE_HEADER_SIZE: usize = 32;
/// Size of one directory entry.
pub const DIRECTORY_ENTRY_SIZE: usize = UFIF_NAME_MAX + 16;

/// Digest header version; only the high 16 bits are checked.
pub const DIGEST_HEADER_VERSION: u32 = 0x0000_0004;
/// Size of the per-module digest header.
pub const DIGEST_HEADER_SIZE: usize = 512;
/// Offset of the `ver` field within the digest header.
pub const DIGEST_VER_OFFSET: usize = 256;
/// Offset of the module identifier within the digest header.
pub const DIGEST_ID_OFFSET: usize = 260;
/// Size of the module identifier buffer (null terminated).
pub const DIGEST_ID_SIZE: usize = 8;
/// Offset of the dotted version string within the digest header.
pub const DIGEST_BIN_VER_OFFSET: usize = 268;
/// Size of the dotted version string buffer.
pub const DIGEST_BIN_VER_SIZE: usize = 12;

// ============================================================================
// Size Constants
// ============================================================================

pub const PAGE_SIZE: usize = 4096;
/// Transfer block size used by the device.
pub const BLOCK_SIZE: u32 = 512 * 1024;
/// CRCs are computed over a multiple of this many bytes.
pub const CRC_ALIGN: usize = 4;

// ============================================================================
// Modules
// ============================================================================

/// Operational firmware. Never deleted; anchors final activation.
pub const OPFW: &str = "OPFW";
/// Device-internal bookkeeping module, hidden from version listings.
pub const SCRAP: &str = "SCRAP";

/// Module names accepted in a firmware image.
pub const ALLOWED_MODULES: &[&str] = &[
    "OPFW", "NNLED", "DNET", "RECOG", "YOLO", "AS2DLR", "NNLAS", "NNLEDR", "SPOOFS", "ASDISP",
    "ACCNET", "ASVIS",
];

/// Check a module name against [`ALLOWED_MODULES`].
pub fn is_allowed_module(name: &str) -> bool {
    ALLOWED_MODULES.contains(&name)
}

// ============================================================================
// Serial Defaults
// ============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Response Markers
// ============================================================================

pub const MARKER_DLINFO_END: &str = "dlinfo end";
pub const MARKER_DLINIT_ERROR: &str = "err ";
pub const MARKER_BLOCK_RESULT: &str = "dl ret=";
pub const MARKER_VALIDATION_OK: &str = "validation ok";

// ============================================================================
// Timeouts
// ============================================================================

/// Delay before scanning the `dlver` response.
pub const VERSION_SETTLE: Duration = Duration::from_millis(200);
/// Delay before scanning for a `dlinit` error.
pub const DLINIT_SETTLE: Duration = Duration::from_millis(50);
/// Block table query issued before burning a module.
pub const BLOCK_TABLE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Block table query issued after all blocks were sent.
pub const VERIFY_TIMEOUT: Duration = Duration::from_millis(3000);
/// Wait for "validation ok" after a non-final activation.
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Timeout for the result of one block transfer, calibrated at 2s per 64 KiB.
pub fn block_result_timeout(block_size: u32) -> Duration {
    Duration::from_millis(2000 * u64::from(block_size) / (64 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_modules() {
        assert!(is_allowed_module(OPFW));
        assert!(is_allowed_module("SPOOFS"));
        assert!(!is_allowed_module(SCRAP));
        assert!(!is_allowed_module("opfw"));
    }

    #[test]
    fn test_block_result_timeout() {
        assert_eq!(block_result_timeout(BLOCK_SIZE), Duration::from_secs(16));
        assert_eq!(block_result_timeout(64 * 1024), Duration::from_secs(2));
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(DIRECTORY_ENTRY_SIZE, 80);
        assert!(DIGEST_BIN_VER_OFFSET + DIGEST_BIN_VER_SIZE <= DIGEST_HEADER_SIZE);
    }
}
