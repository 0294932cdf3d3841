//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow an update run without
//! tight coupling to the engine.

use std::fmt;

use crate::error::ErrorKind;
use crate::state::BurnState;

/// Phases of an update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Nothing started yet.
    Idle,
    /// Waiting for the device to go quiet and switching speed.
    Preparing,
    /// Reading the device's module table.
    Discovery,
    /// Removing modules the image no longer carries.
    Cleanup,
    /// Declaring modules the device does not know yet.
    Initialization,
    /// Burning modules.
    Burning,
    /// All modules done.
    Complete,
    /// Run aborted.
    Failed,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "Idle"),
            UpdatePhase::Preparing => write!(f, "Preparing"),
            UpdatePhase::Discovery => write!(f, "Discovery"),
            UpdatePhase::Cleanup => write!(f, "Cleanup"),
            UpdatePhase::Initialization => write!(f, "Initialization"),
            UpdatePhase::Burning => write!(f, "Burning"),
            UpdatePhase::Complete => write!(f, "Complete"),
            UpdatePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted during an update run.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Run phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// A module's burn state machine moved.
    BurnStateChanged {
        module: String,
        from: BurnState,
        to: BurnState,
    },
    /// Burn of a module started; `pending` of `total` blocks need transfer.
    ModuleStarted {
        module: String,
        pending: usize,
        total: usize,
    },
    /// Module already up to date on the device.
    ModuleSkipped { module: String },
    /// Obsolete module removed from the device.
    ModuleRemoved { module: String },
    /// Module declared to the device.
    ModuleCreated { module: String },
    /// One block written and acknowledged.
    BlockWritten {
        module: String,
        index: usize,
        size: usize,
    },
    /// Module burned and activated.
    ModuleFinished { module: String },
    /// Overall progress in `[0, 1]`.
    Progress { fraction: f32 },
    /// Run failed.
    Error { kind: ErrorKind, message: String },
    /// All modules completed successfully.
    Complete,
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::BurnStateChanged { module, from, to } => {
                tracing::debug!(module = %module, from = %from, to = %to, "Burn state");
            }
            UpdateEvent::ModuleStarted {
                module,
                pending,
                total,
            } => {
                tracing::info!(module = %module, "Updating {} of {} blocks", pending, total);
            }
            UpdateEvent::ModuleSkipped { module } => {
                tracing::info!(module = %module, "Module up to date, skipping");
            }
            UpdateEvent::ModuleRemoved { module } => {
                tracing::info!(module = %module, "Cleaned obsolete module");
            }
            UpdateEvent::ModuleCreated { module } => {
                tracing::info!(module = %module, "Initialized new module");
            }
            UpdateEvent::BlockWritten {
                module,
                index,
                size,
            } => {
                tracing::debug!(module = %module, block = index, size = size, "Block written");
            }
            UpdateEvent::ModuleFinished { module } => {
                tracing::info!(module = %module, "Module done");
            }
            UpdateEvent::Progress { fraction } => {
                tracing::trace!(progress = %format!("{:.1}%", fraction * 100.0), "Progress");
            }
            UpdateEvent::Error { kind, message } => {
                tracing::error!(kind = %kind, "Error: {}", message);
            }
            UpdateEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<UpdateEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<UpdateEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl UpdateObserver for RecordingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
