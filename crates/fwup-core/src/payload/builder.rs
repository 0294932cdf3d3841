//! Container image builder.
//!
//! Produces well-formed UFIF images from module bodies. Used by `xtask pack`
//! and by tests that need real images on disk.

use std::path::Path;

use crate::crc::{crc_aligned, crc32};
use crate::protocol::constants::UFIF_ALIGN;
use crate::protocol::header::{DigestHeader, DirectoryEntry, FileHeader};

#[derive(Debug, Clone)]
struct ModuleSpec {
    name: String,
    version: String,
    body: Vec<u8>,
}

impl ModuleSpec {
    /// Digest header followed by the body.
    fn payload(&self) -> Vec<u8> {
        let mut payload = DigestHeader::new(&self.name, &self.version).to_bytes();
        payload.extend_from_slice(&self.body);
        payload
    }
}

/// Builder for UFIF firmware images.
#[derive(Debug, Clone, Default)]
pub struct ContainerBuilder {
    modules: Vec<ModuleSpec>,
    otp_encrypt_version: u8,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn otp_encrypt_version(mut self, version: u8) -> Self {
        self.otp_encrypt_version = version;
        self
    }

    /// Append a module. `body` is everything after the digest header.
    pub fn module(mut self, name: &str, version: &str, body: Vec<u8>) -> Self {
        self.modules.push(ModuleSpec {
            name: name.to_string(),
            version: version.to_string(),
            body,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = self.modules.iter().map(ModuleSpec::payload).collect();

        let mut image =
            FileHeader::new(self.modules.len() as u16, self.otp_encrypt_version).to_bytes();

        for (spec, payload) in self.modules.iter().zip(&payloads) {
            let mut padded = payload.clone();
            padded.resize(crc_aligned(payload.len()), 0);
            let entry = DirectoryEntry {
                name: spec.name.clone(),
                size: payload.len() as u32,
                crc: crc32(0, &padded),
            };
            image.extend_from_slice(&entry.to_bytes());
        }

        let align = UFIF_ALIGN as usize;
        for payload in &payloads {
            let pad = (align - image.len() % align) % align;
            image.resize(image.len() + pad, 0);
            image.extend_from_slice(payload);
        }

        image
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}
