//! Firmware payload handling: container parsing, module/block model and
//! image building.

pub mod builder;
pub mod container;
pub mod module;

pub use builder::ContainerBuilder;
pub use container::{
    Container, ContainerError, modules_from_file, parse_container, parse_file,
    read_otp_encryption, verify_allowed,
};
pub use module::{BlockSpan, FirmwareBlock, FirmwareModule, block_layout, page_aligned, segment};
