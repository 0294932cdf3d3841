//! Device text commands.
//!
//! Every command is a single line. The `Display` impl is the wire format.

use std::fmt;

/// A command understood by the device's download loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `dlver` - list modules with version and state.
    QueryVersions,
    /// `dlinfo <name>` - dump a module's block table.
    QueryBlocks { module: String },
    /// `dlinit ...` - open a write session for one module.
    BeginModule {
        module: String,
        version: String,
        size: u32,
        first: bool,
        crc: u32,
        block_size: u32,
    },
    /// `dl <index>` - begin a block write.
    BeginBlock { index: usize },
    /// `dlact <final>` - activate the module (final also reboots).
    Activate { final_activation: bool },
    /// `dlsize <name> <size>` - declare a module size (zero deletes it).
    SetModuleSize { module: String, size: u32 },
    /// `dlnew <name> <size>` - declare a module the device does not know yet.
    NewModule { module: String, size: u32 },
    /// `dlspd <baud>` - switch the session baud rate.
    SetSpeed { baud_rate: u32 },
}

impl Command {
    /// Command verb, also used to build the `"<verb> ack"` marker.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::QueryVersions => "dlver",
            Command::QueryBlocks { .. } => "dlinfo",
            Command::BeginModule { .. } => "dlinit",
            Command::BeginBlock { .. } => "dl",
            Command::Activate { .. } => "dlact",
            Command::SetModuleSize { .. } => "dlsize",
            Command::NewModule { .. } => "dlnew",
            Command::SetSpeed { .. } => "dlspd",
        }
    }

    /// Whether the sender should wait for an acknowledgement.
    ///
    /// The final activation reboots the device, and size declarations are
    /// not acknowledged while the device sits in its loader.
    pub fn expects_ack(&self) -> bool {
        !matches!(
            self,
            Command::Activate {
                final_activation: true
            } | Command::SetModuleSize { .. }
        )
    }

    /// Marker the device prints when it accepts this command.
    pub fn ack_marker(&self) -> String {
        format!("{} ack", self.verb())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::QueryVersions => write!(f, "dlver"),
            Command::QueryBlocks { module } => write!(f, "dlinfo {}", module),
            Command::BeginModule {
                module,
                version,
                size,
                first,
                crc,
                block_size,
            } => write!(
                f,
                "dlinit {} {} {} {} {:08x} {}",
                module,
                version,
                size,
                u8::from(*first),
                crc,
                block_size
            ),
            Command::BeginBlock { index } => write!(f, "dl {}", index),
            Command::Activate { final_activation } => {
                write!(f, "dlact {}", u8::from(*final_activation))
            }
            Command::SetModuleSize { module, size } => write!(f, "dlsize {} {}", module, size),
            Command::NewModule { module, size } => write!(f, "dlnew {} {}", module, size),
            Command::SetSpeed { baud_rate } => write!(f, "dlspd {}", baud_rate),
        }
    }
}
