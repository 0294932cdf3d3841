//! serialport-based device link.
//!
//! A background thread reads the port continuously and appends everything
//! to a shared scan buffer; waits block on a condition variable until the
//! buffer satisfies them or the deadline passes.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceLink, LinkError, Scan};
use crate::protocol::Command;

/// Port read timeout; bounds how long the reader takes to notice a stop.
const READ_POLL: Duration = Duration::from_millis(50);
/// Wait for a command's `"<verb> ack"`.
const COMMAND_ACK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Silence that counts as idle.
const IDLE_QUIET: Duration = Duration::from_millis(100);
/// Upper bound on waiting for the device to go idle.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    buffer: String,
    transcript: String,
    last_rx: Instant,
    running: bool,
}

struct Inner {
    state: Mutex<Shared>,
    signal: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Device link over a serial port.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    inner: Arc<Inner>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open `port_name` and start the response reader.
    #[instrument(level = "info")]
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| LinkError::OpenFailed {
                port: port_name.to_string(),
                message: e.to_string(),
            })?;
        let reader_port = port.try_clone()?;

        let inner = Arc::new(Inner {
            state: Mutex::new(Shared {
                buffer: String::new(),
                transcript: String::new(),
                last_rx: Instant::now(),
                running: true,
            }),
            signal: Condvar::new(),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let inner = Arc::clone(&inner);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("fwup-reader".into())
                .spawn(move || reader_loop(reader_port, inner, stop))?
        };

        info!(port = %port_name, baud_rate, "Serial link opened");

        Ok(Self {
            port,
            inner,
            stop,
            reader: Some(reader),
        })
    }

    fn record(&self, line: &str) {
        let mut state = self.inner.lock();
        state.transcript.push_str(line);
        state.transcript.push('\n');
    }
}

fn reader_loop(mut port: Box<dyn SerialPort>, inner: Arc<Inner>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut state = inner.lock();
                state.buffer.push_str(&text);
                state.transcript.push_str(&text);
                state.last_rx = Instant::now();
                inner.signal.notify_all();
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(error = %e, "Serial read failed, stopping reader");
                break;
            }
        }
    }
    inner.lock().running = false;
    inner.signal.notify_all();
}

impl DeviceLink for SerialLink {
    #[instrument(skip(self), fields(cmd = %command))]
    fn send_command(&mut self, command: &Command) -> Result<(), LinkError> {
        let line = command.to_string();
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        self.record(&format!(">> {}", line));
        debug!("Command sent");

        if command.expects_ack() {
            self.wait_for(&command.ack_marker(), COMMAND_ACK_TIMEOUT)?;
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send_binary(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        self.record(&format!(">> [binary {} bytes]", data.len()));
        Ok(())
    }

    fn snapshot(&mut self) -> Scan {
        Scan::new(self.inner.lock().buffer.clone())
    }

    fn consume(&mut self, scan: Scan) {
        let mut state = self.inner.lock();
        let n = scan.len().min(state.buffer.len());
        state.buffer.drain(..n);
    }

    fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<Scan, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if state.buffer.contains(marker) {
                return Ok(Scan::new(state.buffer.clone()));
            }
            if !state.running {
                return Err(LinkError::ReaderStopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::Timeout {
                    marker: marker.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            state = self
                .inner
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn wait_idle(&mut self) -> Result<Scan, LinkError> {
        let deadline = Instant::now() + IDLE_TIMEOUT;
        loop {
            let quiet_for = self.inner.lock().last_rx.elapsed();
            if quiet_for >= IDLE_QUIET {
                return Ok(self.snapshot());
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout {
                    marker: "<idle>".into(),
                    timeout_ms: IDLE_TIMEOUT.as_millis() as u64,
                });
            }
            thread::sleep(IDLE_QUIET - quiet_for);
        }
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError> {
        self.port.set_baud_rate(baud_rate)?;
        info!(baud_rate, "Baud rate changed");
        Ok(())
    }

    fn stop_reader(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take()
            && handle.join().is_err()
        {
            warn!("Reader thread panicked");
        }
    }

    fn transcript(&self) -> String {
        self.inner.lock().transcript.clone()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
