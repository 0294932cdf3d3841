//! Update orchestrator.
//!
//! Sequences a whole run against one device: idle wait and speed switch,
//! module discovery, obsolete module cleanup, new module declaration and
//! a burn per module in image order.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::device::{DeviceModuleState, ModuleState, query_modules};
use crate::error::Result;
use crate::events::{UpdateEvent, UpdateObserver, UpdatePhase};
use crate::payload::{FirmwareModule, verify_allowed};
use crate::protocol::Command;
use crate::protocol::constants::{BLOCK_SIZE, DEFAULT_BAUD_RATE, OPFW};
use crate::state::{BurnOptions, BurnOutcome, ModuleBurner, ProgressTracker};
use crate::transport::DeviceLink;

/// Settings of one update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    /// Serial port the device is attached to.
    pub port: String,
    pub baud_rate: u32,
    pub firmware_path: PathBuf,
    /// Transfer every block of every module regardless of device CRCs.
    pub force_full: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            firmware_path: PathBuf::new(),
            force_full: false,
        }
    }
}

/// Drives update runs over a device link.
pub struct UpdateEngine<L: DeviceLink, O: UpdateObserver + ?Sized> {
    link: L,
    observer: Arc<O>,
    block_size: u32,
    phase: UpdatePhase,
}

impl<L: DeviceLink, O: UpdateObserver + ?Sized> UpdateEngine<L, O> {
    pub fn new(link: L, observer: Arc<O>) -> Self {
        Self {
            link,
            observer,
            block_size: BLOCK_SIZE,
            phase: UpdatePhase::Idle,
        }
    }

    /// Use a block size other than the protocol default. Modules must have
    /// been parsed with the same size.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    fn set_phase(&mut self, to: UpdatePhase) {
        self.observer.on_event(&UpdateEvent::PhaseChanged {
            from: self.phase,
            to,
        });
        self.phase = to;
    }

    /// Burn `modules` onto the device.
    ///
    /// `on_progress` receives 0.0 once discovery succeeded, a step per
    /// block (transferred or skipped) and 1.0 on success.
    #[instrument(skip_all, fields(modules = modules.len(), force_full = settings.force_full))]
    pub fn burn_modules(
        &mut self,
        settings: &UpdateSettings,
        modules: &[FirmwareModule],
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<()> {
        if modules.is_empty() {
            warn!("Received empty modules list");
            return Ok(());
        }
        let total_blocks: usize = modules.iter().map(FirmwareModule::block_count).sum();
        if total_blocks == 0 {
            warn!("Total number of blocks is zero");
            return Ok(());
        }

        let observer = Arc::clone(&self.observer);
        let mut sink = |fraction: f32| {
            observer.on_event(&UpdateEvent::Progress { fraction });
            on_progress(fraction);
        };
        let mut progress = ProgressTracker::new(total_blocks, &mut sink);

        match self.run(settings, modules, &mut progress) {
            Ok(()) => {
                self.set_phase(UpdatePhase::Complete);
                self.observer.on_event(&UpdateEvent::Complete);
                Ok(())
            }
            Err(e) => {
                self.set_phase(UpdatePhase::Failed);
                self.observer.on_event(&UpdateEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn run(
        &mut self,
        settings: &UpdateSettings,
        modules: &[FirmwareModule],
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        self.set_phase(UpdatePhase::Preparing);
        let scan = self.link.wait_idle()?;
        self.link.consume(scan);
        self.link.send_command(&Command::SetSpeed {
            baud_rate: settings.baud_rate,
        })?;
        self.link.set_baud_rate(settings.baud_rate)?;

        self.set_phase(UpdatePhase::Discovery);
        let device_modules = query_modules(&mut self.link)?;
        progress.start();

        self.set_phase(UpdatePhase::Cleanup);
        self.clean_obsolete_modules(modules, &device_modules)?;

        self.set_phase(UpdatePhase::Initialization);
        self.init_new_modules(modules, &device_modules)?;

        self.set_phase(UpdatePhase::Burning);
        let last = modules.len() - 1;
        for (index, module) in modules.iter().enumerate() {
            let payload = module.load_payload()?;
            let options = BurnOptions {
                is_first: index == 0,
                is_last: index == last,
                force_full: settings.force_full,
                block_size: self.block_size,
            };
            let outcome = ModuleBurner::new(&mut self.link, self.observer.as_ref(), module, options)
                .run(&payload, progress)?;
            if let BurnOutcome::Burned { blocks_written } = outcome {
                info!(module = %module.name, blocks_written, "Module burned");
            }
            self.observer.on_event(&UpdateEvent::ModuleFinished {
                module: module.name.clone(),
            });
        }

        progress.finish();
        Ok(())
    }

    /// Zero the size of device modules the image does not carry. `OPFW` and
    /// modules that are already empty are left alone.
    fn clean_obsolete_modules(
        &mut self,
        file_modules: &[FirmwareModule],
        device_modules: &[DeviceModuleState],
    ) -> Result<()> {
        for device_module in device_modules {
            if device_module.state == ModuleState::Empty || device_module.name == OPFW {
                continue;
            }
            if file_modules.iter().any(|m| m.name == device_module.name) {
                continue;
            }

            info!(module = %device_module.name, "Clean obsolete module");
            self.link.send_command(&Command::SetModuleSize {
                module: device_module.name.clone(),
                size: 0,
            })?;
            let scan = self.link.wait_idle()?;
            self.link.consume(scan);
            self.observer.on_event(&UpdateEvent::ModuleRemoved {
                module: device_module.name.clone(),
            });
        }
        Ok(())
    }

    /// Declare image modules the device does not know yet.
    fn init_new_modules(
        &mut self,
        file_modules: &[FirmwareModule],
        device_modules: &[DeviceModuleState],
    ) -> Result<()> {
        for module in file_modules {
            if device_modules.iter().any(|d| d.name == module.name) {
                continue;
            }

            verify_allowed(&module.name)?;
            info!(module = %module.name, "Init new module");
            self.link.send_command(&Command::NewModule {
                module: module.name.clone(),
                size: module.size as u32,
            })?;
            let scan = self.link.wait_idle()?;
            self.link.consume(scan);
            self.observer.on_event(&UpdateEvent::ModuleCreated {
                module: module.name.clone(),
            });
        }
        Ok(())
    }
}
