//! fwup-core: firmware updater for F45x biometric modules over serial.
//!
//! Firmware ships as a UFIF container bundling independently versioned
//! modules. Each module is split into CRC protected blocks; an update
//! transfers only the blocks the device cannot prove it already holds.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Container layout constants, header structures, device commands
//! - **Payload**: Container parsing, block segmentation, image building
//! - **Transport**: Device link abstraction (serial, mock)
//! - **Device**: Module table discovery
//! - **State**: Block reconciliation and the per-module burn state machine
//! - **Engine**: Run orchestration and progress
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Configuration, serial setup and transcripts
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::session::{SessionConfig, UpdateSession};
//!
//! let config = SessionConfig {
//!     port: Some("/dev/ttyACM0".to_string()),
//!     firmware_path: Some("firmware.bin".into()),
//!     ..Default::default()
//! };
//!
//! let session = UpdateSession::new(config);
//! session.run(&mut |p| println!("{:.0}%", p * 100.0)).expect("update failed");
//! ```

pub mod crc;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use device::{DeviceModuleState, ModuleState, query_modules};
pub use engine::{UpdateEngine, UpdateSettings};
pub use error::{ErrorKind, UpdateError};
pub use events::{NullObserver, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
pub use payload::{
    Container, ContainerBuilder, ContainerError, FirmwareBlock, FirmwareModule, modules_from_file,
    parse_file, read_otp_encryption,
};
pub use protocol::Command;
pub use session::{SessionConfig, UpdateSession};
pub use state::{BlockPlan, BurnState, plan_blocks};
pub use transport::{DeviceLink, LinkError, MockLink, SerialLink};
