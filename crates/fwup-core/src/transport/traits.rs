//! Device link abstraction.
//!
//! Defines the `DeviceLink` trait over the device's serial channel,
//! allowing different implementations (serialport, mock, etc.).
//!
//! Incoming text accumulates in a scan buffer. Callers take a [`Scan`]
//! snapshot (directly, after a settle delay, or once a marker shows up),
//! inspect it, and hand it back through [`DeviceLink::consume`] so the
//! next wait does not match stale text.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::Command;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Timeout after {timeout_ms}ms waiting for \"{marker}\"")]
    Timeout { marker: String, timeout_ms: u64 },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Response reader is stopped")]
    ReaderStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of the scan buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    text: String,
}

impl Scan {
    pub fn new(text: String) -> Self {
        Self { text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of buffered bytes this scan covers.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn contains(&self, marker: &str) -> bool {
        self.text.contains(marker)
    }
}

/// Abstract device channel.
///
/// This trait enables:
/// - Production implementation over a serial port
/// - Mock implementation simulating the device for unit tests
pub trait DeviceLink: Send {
    /// Send a command line. Waits for `"<verb> ack"` when
    /// [`Command::expects_ack`] says so.
    fn send_command(&mut self, command: &Command) -> Result<(), LinkError>;

    /// Send a raw binary payload.
    fn send_binary(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Current contents of the scan buffer.
    fn snapshot(&mut self) -> Scan;

    /// Drop the scanned prefix from the buffer.
    fn consume(&mut self, scan: Scan);

    /// Block until `marker` shows up in the buffer or `timeout` elapses.
    fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<Scan, LinkError>;

    /// Block until the device stops sending.
    fn wait_idle(&mut self) -> Result<Scan, LinkError>;

    /// Wait a fixed delay, then snapshot.
    fn settle(&mut self, delay: Duration) -> Result<Scan, LinkError> {
        std::thread::sleep(delay);
        Ok(self.snapshot())
    }

    /// Change the host side baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError>;

    /// Stop collecting responses. Used right before the device reboots.
    fn stop_reader(&mut self);

    /// Everything exchanged so far, for postmortem diagnosis.
    fn transcript(&self) -> String;
}

impl<L: DeviceLink + ?Sized> DeviceLink for &mut L {
    fn send_command(&mut self, command: &Command) -> Result<(), LinkError> {
        (**self).send_command(command)
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), LinkError> {
        (**self).send_binary(data)
    }

    fn snapshot(&mut self) -> Scan {
        (**self).snapshot()
    }

    fn consume(&mut self, scan: Scan) {
        (**self).consume(scan)
    }

    fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<Scan, LinkError> {
        (**self).wait_for(marker, timeout)
    }

    fn wait_idle(&mut self) -> Result<Scan, LinkError> {
        (**self).wait_idle()
    }

    fn settle(&mut self, delay: Duration) -> Result<Scan, LinkError> {
        (**self).settle(delay)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError> {
        (**self).set_baud_rate(baud_rate)
    }

    fn stop_reader(&mut self) {
        (**self).stop_reader()
    }

    fn transcript(&self) -> String {
        (**self).transcript()
    }
}
