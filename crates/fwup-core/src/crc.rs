//! Seeded CRC-32 used for module and block identity.
//!
//! The device and host both compute CRC-32 (IEEE) over 4-byte aligned byte
//! counts. The whole module is seeded with 0 and block `i` with `i`, so two
//! blocks with identical content at different indices never collide.

use crate::protocol::constants::CRC_ALIGN;

/// Streaming CRC-32 with an explicit seed.
#[derive(Clone)]
pub struct SeededCrc {
    hasher: crc32fast::Hasher,
}

impl SeededCrc {
    pub fn new(seed: u32) -> Self {
        Self {
            hasher: crc32fast::Hasher::new_with_initial(seed),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// One-shot CRC of `data` with `seed`.
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut crc = SeededCrc::new(seed);
    crc.update(data);
    crc.finalize()
}

/// Round a byte count up to the CRC word size.
pub const fn crc_aligned(len: usize) -> usize {
    (len + CRC_ALIGN - 1) & !(CRC_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_zero_is_plain_crc32() {
        // Standard CRC-32 check value.
        assert_eq!(crc32(0, b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut crc = SeededCrc::new(3);
        for chunk in data.chunks(777) {
            crc.update(chunk);
        }
        assert_eq!(crc.finalize(), crc32(3, &data));
    }

    #[test]
    fn test_seed_changes_result() {
        let data = [0xA5u8; 64];
        assert_ne!(crc32(0, &data), crc32(1, &data));
    }

    #[test]
    fn test_crc_aligned() {
        assert_eq!(crc_aligned(0), 0);
        assert_eq!(crc_aligned(1), 4);
        assert_eq!(crc_aligned(4), 4);
        assert_eq!(crc_aligned(4097), 4100);
    }
}
