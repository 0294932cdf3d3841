//! Mock device link for testing.
//!
//! Simulates the device's download loader: a module table, per-module block
//! tables, write sessions, CRC checks of received blocks and activation.
//! Faults can be injected to exercise the error paths of the engine.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::{DeviceLink, LinkError, Scan};
use crate::crc::crc32;
use crate::device::ModuleState;
use crate::payload::FirmwareModule;
use crate::protocol::Command;
use crate::protocol::constants::{PAGE_SIZE, SCRAP};

/// Return code for a block whose length differs from the announced size.
const BAD_LENGTH: i32 = -22;

/// Number of blocks the device keeps for a module of `size` bytes.
fn device_block_count(size: u32, block_size: u32) -> usize {
    if block_size == 0 {
        return 0;
    }
    let pages = (size as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    pages.div_ceil(block_size as usize)
}

/// Bytes the device expects for block `index`: the module's word aligned
/// data, cut into `block_size` pieces.
fn device_block_len(size: u32, block_size: u32, index: usize) -> Option<usize> {
    if index >= device_block_count(size, block_size) {
        return None;
    }
    let stored = (size as usize + 3) & !3;
    let block_size = block_size as usize;
    Some(block_size.min(stored.saturating_sub(index * block_size)))
}

/// One row of a simulated block table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBlock {
    pub status: String,
    pub hdr_crc: u32,
    pub real_crc: u32,
}

impl MockBlock {
    pub fn ok(crc: u32) -> Self {
        Self {
            status: "OK".into(),
            hdr_crc: crc,
            real_crc: crc,
        }
    }
}

/// A module as the simulated device knows it.
#[derive(Debug, Clone)]
pub struct MockModule {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
    pub size: u32,
    pub block_size: u32,
    /// Block table rows; `None` rows are not reported.
    pub blocks: Vec<Option<MockBlock>>,
}

/// Traffic from host to device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Command(Command),
    Binary(usize),
}

#[derive(Debug, Default)]
struct Faults {
    dlinit_error: bool,
    no_modules: bool,
    silent_activation: bool,
    mute_block_ack: bool,
    silent_results: HashSet<usize>,
    reject_blocks: HashSet<usize>,
    corrupt_blocks: HashSet<usize>,
}

#[derive(Debug)]
enum Pending {
    Nothing,
    CrcTable,
    Block(usize),
}

#[derive(Debug)]
struct Session {
    module: String,
    announced: Vec<u32>,
}

#[derive(Debug)]
struct MockDevice {
    modules: Vec<MockModule>,
    session: Option<Session>,
    pending: Pending,
    faults: Faults,
    buffer: String,
    transcript: String,
    log: Vec<Outgoing>,
    reader_running: bool,
    rebooted: bool,
    baud_rate: u32,
}

impl MockDevice {
    fn respond(&mut self, text: &str) {
        self.transcript.push_str(text);
        if self.reader_running {
            self.buffer.push_str(text);
        }
    }

    fn module_mut(&mut self, name: &str) -> Option<&mut MockModule> {
        self.modules.iter_mut().find(|m| m.name == name)
    }

    fn handle_command(&mut self, command: &Command) {
        match command {
            Command::QueryVersions => self.query_versions(),
            Command::QueryBlocks { module } => self.query_blocks(module),
            Command::BeginModule {
                module,
                version,
                size,
                block_size,
                ..
            } => self.begin_module(module, version, *size, *block_size),
            Command::BeginBlock { index } => self.begin_block(*index),
            Command::Activate { final_activation } => self.activate(*final_activation),
            Command::SetModuleSize { module, size } => {
                if let Some(m) = self.module_mut(module)
                    && *size == 0
                {
                    m.state = ModuleState::Empty;
                    m.size = 0;
                    m.blocks.clear();
                }
            }
            Command::NewModule { module, size } => {
                self.respond("dlnew ack\n");
                if self.module_mut(module).is_none() {
                    self.modules.push(MockModule {
                        name: module.clone(),
                        version: "0.0.0.0".into(),
                        state: ModuleState::Empty,
                        size: *size,
                        block_size: 0,
                        blocks: Vec::new(),
                    });
                }
            }
            Command::SetSpeed { baud_rate } => {
                self.baud_rate = *baud_rate;
                self.respond("dlspd ack\n");
            }
        }
    }

    fn query_versions(&mut self) {
        let mut out = String::from("dlver ack\n");
        if !self.faults.no_modules {
            for m in &self.modules {
                let _ = writeln!(
                    out,
                    "{} : [{}] [{}] ({})",
                    m.name,
                    m.name,
                    m.version,
                    m.state.as_str()
                );
            }
            let _ = writeln!(out, "{} : [{}] [0.0.0.1] (active)", SCRAP, SCRAP);
        }
        self.respond(&out);
    }

    fn query_blocks(&mut self, name: &str) {
        let mut out = String::from("dlinfo ack\n");
        match self.modules.iter().find(|m| m.name == name) {
            Some(m) if m.state != ModuleState::Empty => {
                let _ = writeln!(out, "{} is {}", m.name, m.state.as_str());
                let _ = writeln!(out, "{} info", m.name);
                let _ = writeln!(out, "total {}, blkSz {}", m.size, m.block_size);
                write_block_rows(&mut out, &m.blocks);
                let _ = writeln!(out, "{} end", m.name);
                if m.state == ModuleState::ActiveUpdating {
                    // Staging copy of the module being written.
                    let _ = writeln!(out, "{} info", SCRAP);
                    let _ = writeln!(out, "total {}, blkSz {}", m.size + 12, m.block_size);
                    write_block_rows(&mut out, &m.blocks);
                    let _ = writeln!(out, "{} end", SCRAP);
                }
            }
            _ => {
                let _ = writeln!(out, "{} is empty", name);
            }
        }
        out.push_str("dlinfo end\n");
        self.respond(&out);
    }

    fn begin_module(&mut self, name: &str, version: &str, size: u32, block_size: u32) {
        self.respond("dlinit ack\n");
        if self.faults.dlinit_error {
            self.respond("err -5 session refused\n");
            return;
        }

        let n_blocks = device_block_count(size, block_size);
        if self.module_mut(name).is_none() {
            self.modules.push(MockModule {
                name: name.to_string(),
                version: version.to_string(),
                state: ModuleState::Empty,
                size,
                block_size,
                blocks: Vec::new(),
            });
        }
        if let Some(m) = self.module_mut(name) {
            let resuming = m.state == ModuleState::ActiveUpdating
                && m.size == size
                && m.block_size == block_size;
            if !resuming {
                m.blocks = vec![None; n_blocks];
            }
            m.blocks.resize(n_blocks, None);
            m.state = ModuleState::ActiveUpdating;
            m.version = version.to_string();
            m.size = size;
            m.block_size = block_size;
        }
        self.session = Some(Session {
            module: name.to_string(),
            announced: Vec::new(),
        });
        self.pending = Pending::CrcTable;
    }

    fn begin_block(&mut self, index: usize) {
        self.respond("dl ack\n");
        let Some(session) = &self.session else {
            self.respond("err no session\n");
            return;
        };
        let name = session.module.clone();
        let Some(m) = self.modules.iter().find(|m| m.name == name) else {
            return;
        };
        let Some(len) = device_block_len(m.size, m.block_size, index) else {
            self.respond("err bad block\n");
            return;
        };
        if !self.faults.mute_block_ack {
            let line = format!("{} : blk {} sz={}\n", name, index, len);
            self.respond(&line);
        }
        self.pending = Pending::Block(index);
    }

    fn receive_binary(&mut self, data: &[u8]) {
        match std::mem::replace(&mut self.pending, Pending::Nothing) {
            Pending::Nothing => {}
            Pending::CrcTable => {
                if let Some(session) = &mut self.session {
                    session.announced = data
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                }
            }
            Pending::Block(index) => self.store_block(index, data),
        }
    }

    fn store_block(&mut self, index: usize, data: &[u8]) {
        if self.faults.reject_blocks.contains(&index) {
            self.respond("dl ret=-3\n");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let name = session.module.clone();
        let hdr_crc = session.announced.get(index).copied().unwrap_or(0);
        let corrupt = self.faults.corrupt_blocks.contains(&index);
        let silent = self.faults.silent_results.contains(&index);
        let Some(m) = self.module_mut(&name) else {
            return;
        };
        if device_block_len(m.size, m.block_size, index) != Some(data.len()) {
            let line = format!("dl ret={}\n", BAD_LENGTH);
            self.respond(&line);
            return;
        }
        let mut real_crc = crc32(index as u32, data);
        if corrupt {
            real_crc = !real_crc;
        }
        m.blocks[index] = Some(MockBlock {
            status: "OK".into(),
            hdr_crc,
            real_crc,
        });
        if !silent {
            self.respond("dl ret=0\n");
        }
    }

    fn activate(&mut self, final_activation: bool) {
        if final_activation {
            for m in &mut self.modules {
                if m.state == ModuleState::ActiveUpdating {
                    m.state = ModuleState::Active;
                }
            }
            self.session = None;
            self.rebooted = true;
            return;
        }

        self.respond("dlact ack\n");
        if let Some(session) = self.session.take()
            && let Some(m) = self.module_mut(&session.module)
        {
            m.state = ModuleState::Active;
        }
        if !self.faults.silent_activation {
            self.respond("validation ok\n");
        }
    }
}

fn write_block_rows(out: &mut String, blocks: &[Option<MockBlock>]) {
    out.push_str("blk  state HDR CRC  Real CRC\n");
    for (i, block) in blocks.iter().enumerate() {
        if let Some(b) = block {
            let _ = writeln!(
                out,
                "#{:<3} {:<5} {:08x} {:08x}",
                i, b.status, b.hdr_crc, b.real_crc
            );
        }
    }
}

/// Mock link simulating the device.
#[derive(Clone)]
pub struct MockLink {
    device: Arc<Mutex<MockDevice>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice {
                modules: Vec::new(),
                session: None,
                pending: Pending::Nothing,
                faults: Faults::default(),
                buffer: String::new(),
                transcript: String::new(),
                log: Vec::new(),
                reader_running: true,
                rebooted: false,
                baud_rate: 0,
            })),
        }
    }

    fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a module with an empty block table.
    pub fn install_module(&self, name: &str, version: &str, state: ModuleState) {
        self.device().modules.push(MockModule {
            name: name.to_string(),
            version: version.to_string(),
            state,
            size: 0,
            block_size: 0,
            blocks: Vec::new(),
        });
    }

    /// Add a module whose stored blocks all match `module`.
    pub fn install_verified(&self, module: &FirmwareModule, block_size: u32, state: ModuleState) {
        self.device().modules.push(MockModule {
            name: module.name.clone(),
            version: module.version.clone(),
            state,
            size: module.size as u32,
            block_size,
            blocks: module
                .blocks
                .iter()
                .map(|b| Some(MockBlock::ok(b.crc)))
                .collect(),
        });
    }

    /// Overwrite (or hide, with `None`) one block table row.
    pub fn set_block(&self, module: &str, index: usize, block: Option<MockBlock>) {
        if let Some(m) = self.device().module_mut(module) {
            if m.blocks.len() <= index {
                m.blocks.resize(index + 1, None);
            }
            m.blocks[index] = block;
        }
    }

    /// Answer the next `dlinit` with an error marker.
    pub fn fail_dlinit(&self) {
        self.device().faults.dlinit_error = true;
    }

    /// Report no modules to `dlver`.
    pub fn report_no_modules(&self) {
        self.device().faults.no_modules = true;
    }

    /// Never print "validation ok" after activation.
    pub fn silent_activation(&self) {
        self.device().faults.silent_activation = true;
    }

    /// Never acknowledge a block write.
    pub fn mute_block_ack(&self) {
        self.device().faults.mute_block_ack = true;
    }

    /// Store block `index` but never print its `dl ret=` line.
    pub fn silent_block_result(&self, index: usize) {
        self.device().faults.silent_results.insert(index);
    }

    /// Answer writes of block `index` with a non-zero return code.
    pub fn reject_block(&self, index: usize) {
        self.device().faults.reject_blocks.insert(index);
    }

    /// Store block `index` with a CRC that will not verify.
    pub fn corrupt_block(&self, index: usize) {
        self.device().faults.corrupt_blocks.insert(index);
    }

    /// All traffic sent so far.
    pub fn outgoing(&self) -> Vec<Outgoing> {
        self.device().log.clone()
    }

    /// Commands sent so far.
    pub fn commands(&self) -> Vec<Command> {
        self.device()
            .log
            .iter()
            .filter_map(|o| match o {
                Outgoing::Command(c) => Some(c.clone()),
                Outgoing::Binary(_) => None,
            })
            .collect()
    }

    /// Indices of `dl <index>` commands in send order.
    pub fn block_writes(&self) -> Vec<usize> {
        self.commands()
            .iter()
            .filter_map(|c| match c {
                Command::BeginBlock { index } => Some(*index),
                _ => None,
            })
            .collect()
    }

    pub fn module(&self, name: &str) -> Option<MockModule> {
        self.device().modules.iter().find(|m| m.name == name).cloned()
    }

    pub fn rebooted(&self) -> bool {
        self.device().rebooted
    }

    pub fn reader_running(&self) -> bool {
        self.device().reader_running
    }

    pub fn baud_rate(&self) -> u32 {
        self.device().baud_rate
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLink for MockLink {
    fn send_command(&mut self, command: &Command) -> Result<(), LinkError> {
        let mut device = self.device();
        device.log.push(Outgoing::Command(command.clone()));
        let line = format!(">> {}\n", command);
        device.transcript.push_str(&line);
        device.handle_command(command);
        Ok(())
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut device = self.device();
        device.log.push(Outgoing::Binary(data.len()));
        let line = format!(">> [binary {} bytes]\n", data.len());
        device.transcript.push_str(&line);
        device.receive_binary(data);
        Ok(())
    }

    fn snapshot(&mut self) -> Scan {
        Scan::new(self.device().buffer.clone())
    }

    fn consume(&mut self, scan: Scan) {
        let mut device = self.device();
        let n = scan.len().min(device.buffer.len());
        device.buffer.drain(..n);
    }

    fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<Scan, LinkError> {
        let device = self.device();
        if device.buffer.contains(marker) {
            Ok(Scan::new(device.buffer.clone()))
        } else if !device.reader_running {
            Err(LinkError::ReaderStopped)
        } else {
            Err(LinkError::Timeout {
                marker: marker.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }

    fn wait_idle(&mut self) -> Result<Scan, LinkError> {
        Ok(self.snapshot())
    }

    fn settle(&mut self, _delay: Duration) -> Result<Scan, LinkError> {
        Ok(self.snapshot())
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> Result<(), LinkError> {
        Ok(())
    }

    fn stop_reader(&mut self) {
        self.device().reader_running = false;
    }

    fn transcript(&self) -> String {
        self.device().transcript.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_version_listing() {
        let mut mock = MockLink::new();
        mock.install_module("OPFW", "1.2.3.4", ModuleState::Active);
        mock.send_command(&Command::QueryVersions).unwrap();

        let scan = mock.snapshot();
        assert!(scan.contains("OPFW : [OPFW] [1.2.3.4] (active)"));
        assert!(scan.contains("SCRAP : [SCRAP]"));
    }

    #[test]
    fn test_mock_consume_drops_scanned_prefix() {
        let mut mock = MockLink::new();
        mock.send_command(&Command::SetSpeed { baud_rate: 921600 })
            .unwrap();
        let scan = mock.wait_for("dlspd ack", Duration::from_secs(1)).unwrap();
        mock.consume(scan);
        assert!(mock.snapshot().is_empty());
        assert!(matches!(
            mock.wait_for("dlspd ack", Duration::from_secs(1)),
            Err(LinkError::Timeout { .. })
        ));
        assert_eq!(mock.baud_rate(), 921600);
    }

    #[test]
    fn test_mock_block_write_cycle() {
        let mut mock = MockLink::new();
        mock.send_command(&Command::BeginModule {
            module: "DNET".into(),
            version: "1.0.0".into(),
            size: 5000,
            first: true,
            crc: 0,
            block_size: 4096,
        })
        .unwrap();
        let data = vec![7u8; 8192];
        let expected = [crc32(0, &data[..4096]), crc32(1, &data[4096..5000])];
        let table: Vec<u8> = expected.iter().flat_map(|c| c.to_le_bytes()).collect();
        mock.send_binary(&table).unwrap();

        mock.send_command(&Command::BeginBlock { index: 1 }).unwrap();
        assert!(mock.snapshot().contains("DNET : blk 1 sz=904"));
        mock.send_binary(&data[4096..5000]).unwrap();
        assert!(mock.snapshot().contains("dl ret=0"));

        let module = mock.module("DNET").unwrap();
        assert_eq!(module.state, ModuleState::ActiveUpdating);
        assert_eq!(module.blocks[0], None);
        assert_eq!(module.blocks[1], Some(MockBlock::ok(expected[1])));
        assert_eq!(mock.block_writes(), vec![1]);
    }

    #[test]
    fn test_mock_rejects_padded_last_block() {
        let mut mock = MockLink::new();
        mock.send_command(&Command::BeginModule {
            module: "DNET".into(),
            version: "1.0.0".into(),
            size: 4099,
            first: true,
            crc: 0,
            block_size: 4096,
        })
        .unwrap();
        mock.send_binary(&[0u8; 8]).unwrap();

        mock.send_command(&Command::BeginBlock { index: 1 }).unwrap();
        assert!(mock.snapshot().contains("DNET : blk 1 sz=4\n"));
        mock.send_binary(&[0u8; 4096]).unwrap();
        assert!(mock.snapshot().contains("dl ret=-22"));
        assert_eq!(mock.module("DNET").unwrap().blocks[1], None);
    }

    #[test]
    fn test_mock_stopped_reader_drops_responses() {
        let mut mock = MockLink::new();
        mock.stop_reader();
        mock.send_command(&Command::QueryVersions).unwrap();
        assert!(mock.snapshot().is_empty());
        assert!(mock.transcript().contains("dlver ack"));
    }
}
