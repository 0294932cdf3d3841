//! Update session - high-level entry point for a firmware update.
//!
//! Loads and validates the image, opens the serial link, runs the engine
//! and always leaves a transcript of the exchange behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::device::{DeviceModuleState, query_modules};
use crate::engine::{UpdateEngine, UpdateSettings};
use crate::events::{TracingObserver, UpdateObserver};
use crate::payload::{FirmwareModule, modules_from_file};
use crate::protocol::constants::{BLOCK_SIZE, DEFAULT_BAUD_RATE};
use crate::transport::{DeviceLink, SerialLink};

/// Default transcript location.
pub const DEFAULT_TRANSCRIPT: &str = "fw-update.log";

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial port of the device.
    pub port: Option<String>,
    /// Baud rate switched to once the device is idle.
    pub baud_rate: u32,
    /// Firmware image.
    pub firmware_path: Option<PathBuf>,
    /// Transfer every block regardless of device CRCs.
    pub force_full: bool,
    /// Where the protocol transcript is written after each run.
    pub transcript_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            firmware_path: None,
            force_full: false,
            transcript_path: PathBuf::from(DEFAULT_TRANSCRIPT),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Engine settings. Port and image are required.
    pub fn settings(&self) -> Result<UpdateSettings> {
        let port = self
            .port
            .clone()
            .ok_or_else(|| anyhow!("No serial port configured"))?;
        let firmware_path = self
            .firmware_path
            .clone()
            .ok_or_else(|| anyhow!("No firmware image configured"))?;
        Ok(UpdateSettings {
            port,
            baud_rate: self.baud_rate,
            firmware_path,
            force_full: self.force_full,
        })
    }
}

/// Update session - runs one firmware update end to end.
pub struct UpdateSession<O: UpdateObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    block_size: u32,
}

impl UpdateSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: UpdateObserver + 'static> UpdateSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            block_size: BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Parse and validate the configured image.
    pub fn load_modules(&self) -> Result<Vec<FirmwareModule>> {
        let settings = self.config.settings()?;
        let modules = modules_from_file(&settings.firmware_path, self.block_size)
            .with_context(|| format!("Invalid firmware image {}", settings.firmware_path.display()))?;
        Ok(modules)
    }

    /// Run a complete update over the configured serial port.
    #[instrument(skip(self, on_progress))]
    pub fn run(&self, on_progress: &mut dyn FnMut(f32)) -> Result<()> {
        let modules = self.load_modules()?;
        self.run_modules(&modules, on_progress)
    }

    /// Burn already loaded `modules` over the configured serial port. The
    /// port is left untouched when the modules hold no blocks.
    pub fn run_modules(
        &self,
        modules: &[FirmwareModule],
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<()> {
        let settings = self.config.settings()?;
        if modules.iter().all(|m| m.block_count() == 0) {
            warn!(modules = modules.len(), "Image holds no blocks, nothing to update");
            return Ok(());
        }
        let link = SerialLink::open(&settings.port, DEFAULT_BAUD_RATE)
            .with_context(|| format!("Failed to open {}", settings.port))?;
        self.run_with_link(link, &settings, modules, on_progress)
    }

    /// Run an update over an already open link. The transcript is written
    /// whether or not the run succeeds.
    pub fn run_with_link<L: DeviceLink>(
        &self,
        link: L,
        settings: &UpdateSettings,
        modules: &[FirmwareModule],
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<()> {
        info!(
            image = %settings.firmware_path.display(),
            modules = modules.len(),
            "Starting firmware update"
        );
        let mut engine =
            UpdateEngine::new(link, Arc::clone(&self.observer)).with_block_size(self.block_size);
        let result = engine.burn_modules(settings, modules, on_progress);

        if let Err(e) = self.dump_transcript(&engine.link().transcript()) {
            warn!(error = %e, "Failed to write transcript");
        }

        result.context("Firmware update failed")?;
        info!("Firmware update complete");
        Ok(())
    }

    /// Read the device's module table over the configured serial port.
    #[instrument(skip(self))]
    pub fn query_device(&self) -> Result<Vec<DeviceModuleState>> {
        let port = self
            .config
            .port
            .as_deref()
            .ok_or_else(|| anyhow!("No serial port configured"))?;
        let mut link = SerialLink::open(port, self.config.baud_rate)?;
        let scan = link.wait_idle()?;
        link.consume(scan);
        Ok(query_modules(&mut link)?)
    }

    fn dump_transcript(&self, transcript: &str) -> Result<()> {
        let path = &self.config.transcript_path;
        std::fs::write(path, transcript)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Session transcript saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ModuleState;
    use crate::error::{ErrorKind, UpdateError};
    use crate::events::NullObserver;
    use crate::payload::ContainerBuilder;
    use crate::transport::MockLink;

    const BLOCK: u32 = 4096;

    fn config(dir: &Path) -> SessionConfig {
        let image = dir.join("image.bin");
        ContainerBuilder::new()
            .module("OPFW", "6.2.0.1", vec![0xA5; 9000])
            .write_to(&image)
            .unwrap();
        SessionConfig {
            port: Some("/dev/ttyUSB0".into()),
            baud_rate: 230400,
            firmware_path: Some(image),
            force_full: false,
            transcript_path: dir.join("fw-update.log"),
        }
    }

    fn session(config: SessionConfig) -> UpdateSession<NullObserver> {
        UpdateSession::with_observer(config, Arc::new(NullObserver)).with_block_size(BLOCK)
    }

    #[test]
    fn test_config_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let path = dir.path().join("fwup.toml");
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_config_defaults() {
        let config: SessionConfig = toml::from_str("port = \"COM3\"").unwrap();
        assert_eq!(config.port.as_deref(), Some("COM3"));
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.transcript_path, PathBuf::from(DEFAULT_TRANSCRIPT));
        assert!(config.settings().is_err());
    }

    #[test]
    fn test_run_writes_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(config(dir.path()));
        let settings = session.config().settings().unwrap();
        let modules = session.load_modules().unwrap();

        let mock = MockLink::new();
        mock.install_module("OPFW", "6.0.0.0", ModuleState::Active);
        let mut last = 0.0;
        session
            .run_with_link(mock.clone(), &settings, &modules, &mut |f| last = f)
            .unwrap();

        assert_eq!(last, 1.0);
        assert_eq!(mock.baud_rate(), 230400);
        let transcript = std::fs::read_to_string(dir.path().join("fw-update.log")).unwrap();
        assert!(transcript.contains(">> dlspd 230400"));
        assert!(transcript.contains(">> dlact 1"));
    }

    #[test]
    fn test_failed_run_still_writes_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(config(dir.path()));
        let settings = session.config().settings().unwrap();
        let modules = session.load_modules().unwrap();

        let mock = MockLink::new();
        mock.install_module("OPFW", "6.0.0.0", ModuleState::Active);
        mock.fail_dlinit();
        let err = session
            .run_with_link(mock, &settings, &modules, &mut |_| {})
            .unwrap_err();

        let update = err.downcast_ref::<UpdateError>().unwrap();
        assert_eq!(update.kind(), ErrorKind::Protocol);
        let transcript = std::fs::read_to_string(dir.path().join("fw-update.log")).unwrap();
        assert!(transcript.contains("err "));
    }

    #[test]
    fn test_nothing_to_update_leaves_port_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.port = Some(dir.path().join("no-such-port").display().to_string());
        let session = session(config);

        let mut calls = 0;
        session.run_modules(&[], &mut |_| calls += 1).unwrap();

        let mut empty = session.load_modules().unwrap().remove(0);
        empty.blocks.clear();
        session.run_modules(&[empty], &mut |_| calls += 1).unwrap();

        assert_eq!(calls, 0);
        assert!(!dir.path().join("fw-update.log").exists());
    }

    #[test]
    fn test_load_modules_rejects_corrupt_image() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let path = config.firmware_path.clone().unwrap();
        let mut image = std::fs::read(&path).unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        std::fs::write(&path, image).unwrap();

        let err = session(config).load_modules().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid CRC"));
    }
}
