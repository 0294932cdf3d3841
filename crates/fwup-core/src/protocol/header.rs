//! Binary headers of the UFIF firmware container.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid signature: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidSignature { expected: u32, actual: u32 },
    #[error("Unsupported container version 0x{0:04X}")]
    UnsupportedVersion(u16),
    #[error("Incompatible digest header version 0x{0:08X}")]
    DigestVersion(u32),
    #[error("Module id is not null terminated within {max} bytes")]
    UnterminatedId { max: usize },
    #[error("Module {module} has no dotted version string")]
    MissingVersion { module: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container file header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub signature: u32,
    pub version: u16,
    pub entry_count: u16,
    /// OTP encryption version tag. Reported, never acted upon.
    pub otp_encrypt_version: u8,
}

impl FileHeader {
    pub const SIZE: usize = FILE_HEADER_SIZE;

    pub fn new(entry_count: u16, otp_encrypt_version: u8) -> Self {
        Self {
            signature: UFIF_SIGNATURE,
            version: UFIF_VERSION,
            entry_count,
            otp_encrypt_version,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            signature: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u16::<LittleEndian>()?,
            entry_count: cursor.read_u16::<LittleEndian>()?,
            otp_encrypt_version: cursor.read_u8()?,
        })
    }

    /// Check signature and major version.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.signature != UFIF_SIGNATURE {
            return Err(HeaderError::InvalidSignature {
                expected: UFIF_SIGNATURE,
                actual: self.signature,
            });
        }
        if self.version >> 8 != UFIF_VERSION >> 8 {
            return Err(HeaderError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.signature).unwrap();
        buf.write_u16::<LittleEndian>(self.version).unwrap();
        buf.write_u16::<LittleEndian>(self.entry_count).unwrap();
        buf.write_u8(self.otp_encrypt_version).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }
}

/// Directory entry (80 bytes): name, payload size and whole-module CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u32,
    pub crc: u32,
}

impl DirectoryEntry {
    pub const SIZE: usize = DIRECTORY_ENTRY_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let name = c_str(&data[..UFIF_NAME_MAX]);
        let mut cursor = Cursor::new(&data[UFIF_NAME_MAX..]);
        Ok(Self {
            name,
            size: cursor.read_u32::<LittleEndian>()?,
            crc: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; UFIF_NAME_MAX];
        let name = self.name.as_bytes();
        let len = name.len().min(UFIF_NAME_MAX - 1);
        buf[..len].copy_from_slice(&name[..len]);
        buf.write_u32::<LittleEndian>(self.size).unwrap();
        buf.write_u32::<LittleEndian>(self.crc).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }
}

/// Per-module digest header (512 bytes), the first bytes of each payload.
///
/// Signature and key material are carried through untouched; only the
/// version, identifier and dotted version are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestHeader {
    pub ver: u32,
    pub id: String,
    pub bin_version: String,
    pub flags: u32,
    pub bin_size: u32,
    pub iv: [u8; 16],
    pub org_size: u32,
}

impl DigestHeader {
    pub const SIZE: usize = DIGEST_HEADER_SIZE;

    pub fn new(id: &str, bin_version: &str) -> Self {
        Self {
            ver: DIGEST_HEADER_VERSION,
            id: id.to_string(),
            bin_version: bin_version.to_string(),
            flags: 0,
            bin_size: 0,
            iv: [0; 16],
            org_size: 0,
        }
    }

    /// Parse and validate a digest header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[DIGEST_VER_OFFSET..]);
        let ver = cursor.read_u32::<LittleEndian>()?;
        if ver >> 16 != DIGEST_HEADER_VERSION >> 16 {
            return Err(HeaderError::DigestVersion(ver));
        }

        let id_field = &data[DIGEST_ID_OFFSET..DIGEST_ID_OFFSET + DIGEST_ID_SIZE];
        if id_field[DIGEST_ID_SIZE - 1] != 0 {
            return Err(HeaderError::UnterminatedId {
                max: DIGEST_ID_SIZE - 1,
            });
        }
        let id = c_str(id_field);

        let bin_version =
            c_str(&data[DIGEST_BIN_VER_OFFSET..DIGEST_BIN_VER_OFFSET + DIGEST_BIN_VER_SIZE]);
        if !bin_version.contains('.') {
            return Err(HeaderError::MissingVersion { module: id });
        }

        let mut cursor =
            Cursor::new(&data[DIGEST_BIN_VER_OFFSET + DIGEST_BIN_VER_SIZE..Self::SIZE]);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let bin_size = cursor.read_u32::<LittleEndian>()?;
        let mut iv = [0u8; 16];
        cursor.read_exact(&mut iv)?;
        let org_size = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            ver,
            id,
            bin_version,
            flags,
            bin_size,
            iv,
            org_size,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIGEST_VER_OFFSET];
        buf.write_u32::<LittleEndian>(self.ver).unwrap();
        buf.extend_from_slice(&fixed_field(&self.id, DIGEST_ID_SIZE));
        buf.extend_from_slice(&fixed_field(&self.bin_version, DIGEST_BIN_VER_SIZE));
        buf.write_u32::<LittleEndian>(self.flags).unwrap();
        buf.write_u32::<LittleEndian>(self.bin_size).unwrap();
        buf.extend_from_slice(&self.iv);
        buf.write_u32::<LittleEndian>(self.org_size).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }
}

/// Read a null-terminated string out of a fixed buffer.
fn c_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Copy `s` into a zero-filled buffer of `len` bytes, truncating if longer.
fn fixed_field(s: &str, len: usize) -> Vec<u8> {
    let mut field = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}
