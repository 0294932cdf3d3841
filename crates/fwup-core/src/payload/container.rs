//! UFIF container parsing.
//!
//! Layout: file header | directory entries | for each entry, padding to a
//! 16-byte boundary followed by the module payload. Every payload starts
//! with a 512-byte digest header carrying the module id and version.
//!
//! A container is accepted whole or not at all: one bad module fails the
//! entire parse.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use super::module::{FirmwareModule, page_aligned, segment};
use crate::crc::{crc_aligned, crc32};
use crate::protocol::constants::{UFIF_ALIGN, is_allowed_module};
use crate::protocol::header::{DigestHeader, DirectoryEntry, FileHeader, HeaderError};

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Not a valid firmware container: {0}")]
    Header(#[from] HeaderError),
    #[error("Container truncated while reading {0}")]
    Truncated(String),
    #[error("Invalid CRC in module {module}: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ModuleCrcMismatch {
        module: String,
        expected: u32,
        actual: u32,
    },
    #[error("Found invalid module name in file: {0}")]
    UnknownModule(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed container: header plus its modules in file order.
#[derive(Debug, Clone)]
pub struct Container {
    pub header: FileHeader,
    pub modules: Vec<FirmwareModule>,
}

impl Container {
    pub fn total_blocks(&self) -> usize {
        self.modules.iter().map(|m| m.blocks.len()).sum()
    }
}

/// Parse a container from `reader`. `source` is recorded in each module so
/// its payload can be reloaded later.
pub fn parse_container<R: Read + Seek>(
    reader: &mut R,
    source: &Path,
    block_size: u32,
) -> Result<Container, ContainerError> {
    let header = read_file_header(reader)?;

    let mut entries = Vec::with_capacity(header.entry_count as usize);
    for i in 0..header.entry_count {
        let mut raw = [0u8; DirectoryEntry::SIZE];
        read_exact(reader, &mut raw, &format!("directory entry {}", i))?;
        entries.push(DirectoryEntry::from_bytes(&raw)?);
    }

    let mut modules = Vec::with_capacity(entries.len());
    for entry in &entries {
        let mut offset = reader.stream_position()?;
        if offset % UFIF_ALIGN != 0 {
            offset += UFIF_ALIGN - offset % UFIF_ALIGN;
            reader.seek(SeekFrom::Start(offset))?;
        }

        let mut raw = [0u8; DigestHeader::SIZE];
        read_exact(reader, &mut raw, &format!("digest header of {}", entry.name))?;
        let digest = DigestHeader::from_bytes(&raw)?;

        // The digest header is part of the payload.
        reader.seek(SeekFrom::Start(offset))?;

        let size = entry.size as usize;
        let aligned_size = page_aligned(size);
        let mut buffer = vec![0u8; aligned_size];
        read_exact(reader, &mut buffer[..size], &format!("module {}", digest.id))?;

        let actual = crc32(0, &buffer[..crc_aligned(size)]);
        if actual != entry.crc {
            return Err(ContainerError::ModuleCrcMismatch {
                module: digest.id,
                expected: entry.crc,
                actual,
            });
        }

        let blocks = segment(&buffer, size, block_size as usize);
        debug!(
            "[{:>8}] {:.2} MB, {} blocks",
            digest.id,
            size as f64 / 1048576.0,
            blocks.len()
        );

        modules.push(FirmwareModule {
            name: digest.id,
            version: digest.bin_version,
            crc: actual,
            source_file: source.to_path_buf(),
            file_offset: offset,
            size,
            aligned_size,
            blocks,
        });
    }

    for (entry, module) in entries.iter().zip(&modules) {
        verify_allowed(&module.name)?;
        if !entry.name.is_empty() {
            verify_allowed(&entry.name)?;
        }
    }

    Ok(Container { header, modules })
}

/// Parse the container at `path`.
pub fn parse_file<P: AsRef<Path>>(path: P, block_size: u32) -> Result<Container, ContainerError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    parse_container(&mut reader, path, block_size)
}

/// Extract and validate the modules of the image at `path`.
pub fn modules_from_file<P: AsRef<Path>>(
    path: P,
    block_size: u32,
) -> Result<Vec<FirmwareModule>, ContainerError> {
    let path = path.as_ref();
    info!(path = %path.display(), "Extracting modules");
    let container = parse_file(path, block_size)?;
    info!("Extracted {} modules", container.modules.len());
    Ok(container.modules)
}

/// Read only the OTP encryption version tag of the container at `path`.
pub fn read_otp_encryption<P: AsRef<Path>>(path: P) -> Result<u8, ContainerError> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(read_file_header(&mut reader)?.otp_encrypt_version)
}

/// Reject module names outside the allowed set.
pub fn verify_allowed(name: &str) -> Result<(), ContainerError> {
    if is_allowed_module(name) {
        Ok(())
    } else {
        Err(ContainerError::UnknownModule(name.to_string()))
    }
}

fn read_file_header<R: Read>(reader: &mut R) -> Result<FileHeader, ContainerError> {
    let mut raw = [0u8; FileHeader::SIZE];
    read_exact(reader, &mut raw, "file header")?;
    let header = FileHeader::from_bytes(&raw)?;
    header.validate()?;
    Ok(header)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), ContainerError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ContainerError::Truncated(what.to_string()),
        _ => ContainerError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::builder::ContainerBuilder;
    use crate::protocol::constants::{DIRECTORY_ENTRY_SIZE, FILE_HEADER_SIZE};
    use std::io::Cursor;

    fn body(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ salt).collect()
    }

    fn parse(bytes: &[u8], block_size: u32) -> Result<Container, ContainerError> {
        parse_container(&mut Cursor::new(bytes), Path::new("image.bin"), block_size)
    }

    #[test]
    fn test_parse_two_modules() {
        let opfw = body(20000 - 512, 1);
        let spoofs = body(999, 2);
        let image = ContainerBuilder::new()
            .otp_encrypt_version(3)
            .module("OPFW", "6.2.0.1", opfw.clone())
            .module("SPOOFS", "1.4.0", spoofs.clone())
            .build();

        let container = parse(&image, 8192).unwrap();
        assert_eq!(container.header.otp_encrypt_version, 3);
        assert_eq!(container.modules.len(), 2);

        let m = &container.modules[0];
        assert_eq!(m.name, "OPFW");
        assert_eq!(m.version, "6.2.0.1");
        assert_eq!(m.size, 20000);
        assert_eq!(m.aligned_size, 20480);
        assert_eq!(m.blocks.len(), 3);
        assert_eq!(m.file_offset % UFIF_ALIGN, 0);

        let m = &container.modules[1];
        assert_eq!(m.name, "SPOOFS");
        assert_eq!(m.size, 512 + 999);
        assert_eq!(m.blocks.len(), 1);
        assert_eq!(m.file_offset % UFIF_ALIGN, 0);
        assert_eq!(container.total_blocks(), 4);
    }

    #[test]
    fn test_blocks_reconstruct_payload() {
        let opfw = body(30000, 7);
        let image = ContainerBuilder::new()
            .module("OPFW", "1.0.0", opfw.clone())
            .build();
        let container = parse(&image, 4096).unwrap();
        let module = &container.modules[0];

        let start = module.file_offset as usize;
        let mut buffer = vec![0u8; module.aligned_size];
        buffer[..module.size].copy_from_slice(&image[start..start + module.size]);

        let mut rebuilt = Vec::new();
        for block in &module.blocks {
            rebuilt.extend_from_slice(&buffer[block.offset..block.offset + block.size]);
        }
        assert_eq!(rebuilt.len(), module.aligned_size);
        assert_eq!(&rebuilt[512..module.size], &opfw[..]);
        assert!(rebuilt[module.size..].iter().all(|&b| b == 0));
        assert_eq!(crc32(0, &rebuilt[..crc_aligned(module.size)]), module.crc);
    }

    #[test]
    fn test_zero_entries() {
        let image = ContainerBuilder::new().build();
        let container = parse(&image, 4096).unwrap();
        assert!(container.modules.is_empty());
    }

    #[test]
    fn test_bad_signature() {
        let mut image = ContainerBuilder::new()
            .module("OPFW", "1.0.0", body(100, 0))
            .build();
        image[0] ^= 0xFF;
        assert!(matches!(
            parse(&image, 4096),
            Err(ContainerError::Header(HeaderError::InvalidSignature { .. }))
        ));
    }

    #[test]
    fn test_tampered_payload_is_integrity_error() {
        let mut image = ContainerBuilder::new()
            .module("OPFW", "1.0.0", body(5000, 0))
            .build();
        let payload_start = FILE_HEADER_SIZE + DIRECTORY_ENTRY_SIZE;
        image[payload_start + 600] ^= 0x01;
        assert!(matches!(
            parse(&image, 4096),
            Err(ContainerError::ModuleCrcMismatch { ref module, .. }) if module == "OPFW"
        ));
    }

    #[test]
    fn test_tampered_entry_name_is_validation_error() {
        let mut image = ContainerBuilder::new()
            .module("OPFW", "1.0.0", body(5000, 0))
            .build();
        image[FILE_HEADER_SIZE..FILE_HEADER_SIZE + 5].copy_from_slice(b"EVIL\0");
        assert!(matches!(
            parse(&image, 4096),
            Err(ContainerError::UnknownModule(ref name)) if name == "EVIL"
        ));
    }

    #[test]
    fn test_unknown_digest_id_is_validation_error() {
        let image = ContainerBuilder::new()
            .module("ROGUE", "1.0.0", body(5000, 0))
            .build();
        assert!(matches!(
            parse(&image, 4096),
            Err(ContainerError::UnknownModule(ref name)) if name == "ROGUE"
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let image = ContainerBuilder::new()
            .module("OPFW", "1.0.0", body(5000, 0))
            .build();
        let short = &image[..image.len() - 100];
        assert!(matches!(
            parse(short, 4096),
            Err(ContainerError::Truncated(_))
        ));
    }

    #[test]
    fn test_modules_from_file_and_otp_tag() {
        let image = ContainerBuilder::new()
            .otp_encrypt_version(2)
            .module("DNET", "2.0.1", body(70000, 9))
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, &image).unwrap();

        let modules = modules_from_file(&path, 65536).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].source_file, path);
        assert_eq!(read_otp_encryption(&path).unwrap(), 2);

        let payload = modules[0].load_payload().unwrap();
        assert_eq!(payload.len(), modules[0].aligned_size);
        assert_eq!(&payload[512..512 + 70000], &body(70000, 9)[..]);
    }
}
