//! Protocol module - container layout and device command definitions.

pub mod command;
pub mod constants;
pub mod header;

pub use command::Command;
pub use constants::*;
pub use header::{DigestHeader, DirectoryEntry, FileHeader, HeaderError};
