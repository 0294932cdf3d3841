//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::{MockBlock, MockLink};
pub use serial::SerialLink;
pub use traits::{DeviceLink, LinkError, Scan};
