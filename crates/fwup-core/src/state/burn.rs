//! Per-module burn.
//!
//! Drives one module through
//! `Querying -> (Skip | Updating) -> Verifying -> Activating -> Done`,
//! with `Failed` reachable from every state.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::machine::{BurnState, ProgressTracker};
use super::reconcile::{BlockPlan, plan_blocks};
use crate::device::{ModuleState, query_module};
use crate::error::{Result, UpdateError};
use crate::events::{UpdateEvent, UpdateObserver};
use crate::payload::FirmwareModule;
use crate::protocol::Command;
use crate::protocol::constants::{
    ACTIVATION_TIMEOUT, BLOCK_TABLE_TIMEOUT, DLINIT_SETTLE, MARKER_BLOCK_RESULT,
    MARKER_DLINFO_END, MARKER_DLINIT_ERROR, MARKER_VALIDATION_OK, VERIFY_TIMEOUT,
    block_result_timeout,
};
use crate::transport::DeviceLink;

/// Where a module sits in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurnOptions {
    pub is_first: bool,
    /// The last module's activation reboots the device.
    pub is_last: bool,
    pub force_full: bool,
    pub block_size: u32,
}

/// How a module burn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnOutcome {
    /// Already up to date; nothing written.
    Skipped,
    /// `blocks_written` blocks transferred and verified.
    Burned { blocks_written: usize },
}

/// Read the return code of a `dl ret=<int>` line.
pub fn parse_block_result(text: &str) -> Option<i32> {
    let start = text.find(MARKER_BLOCK_RESULT)? + MARKER_BLOCK_RESULT.len();
    let rest = text[start..].trim_start_matches([' ', '\t']);
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    rest[..end].parse().ok()
}

/// Block acknowledgement line the device prints after `dl <index>`.
pub fn block_ack_line(module: &str, index: usize, size: usize) -> String {
    format!("{} : blk {} sz={}", module, index, size)
}

/// Burns one module over a device link.
pub struct ModuleBurner<'a, L: DeviceLink + ?Sized, O: UpdateObserver + ?Sized> {
    link: &'a mut L,
    observer: &'a O,
    module: &'a FirmwareModule,
    options: BurnOptions,
    state: BurnState,
}

impl<'a, L: DeviceLink + ?Sized, O: UpdateObserver + ?Sized> ModuleBurner<'a, L, O> {
    pub fn new(
        link: &'a mut L,
        observer: &'a O,
        module: &'a FirmwareModule,
        options: BurnOptions,
    ) -> Self {
        Self {
            link,
            observer,
            module,
            options,
            state: BurnState::Idle,
        }
    }

    pub fn state(&self) -> BurnState {
        self.state
    }

    fn goto_state(&mut self, next: BurnState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected burn transition");
        }
        debug!(module = %self.module.name, from = %self.state, to = %next, "Burn state transition");
        self.observer.on_event(&UpdateEvent::BurnStateChanged {
            module: self.module.name.clone(),
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    /// Run the module through the state machine. `payload` is the module's
    /// page aligned buffer.
    pub fn run(&mut self, payload: &[u8], progress: &mut ProgressTracker<'_>) -> Result<BurnOutcome> {
        match self.drive(payload, progress) {
            Ok(outcome) => {
                self.goto_state(BurnState::Done);
                Ok(outcome)
            }
            Err(e) => {
                error!(module = %self.module.name, state = %self.state, error = %e, "Burn failed");
                self.goto_state(BurnState::Failed);
                Err(e)
            }
        }
    }

    fn drive(&mut self, payload: &[u8], progress: &mut ProgressTracker<'_>) -> Result<BurnOutcome> {
        self.goto_state(BurnState::Querying);
        let device = query_module(&mut *self.link, &self.module.name)?;
        let mut plan = self.query_block_plan(BLOCK_TABLE_TIMEOUT, self.options.force_full)?;
        debug!(
            module = %self.module.name,
            "Number of blocks to update: {}",
            plan.pending_count()
        );

        if plan.is_complete() && device.state == ModuleState::Active {
            self.goto_state(BurnState::Skip);
            self.observer.on_event(&UpdateEvent::ModuleSkipped {
                module: self.module.name.clone(),
            });
            for _ in 0..self.module.block_count() {
                progress.tick();
            }
            if self.options.is_last {
                self.activate()?;
            }
            return Ok(BurnOutcome::Skipped);
        }

        // Resume only what the device itself reports as interrupted.
        if device.state != ModuleState::ActiveUpdating {
            debug!(module = %self.module.name, state = %device.state, "Resetting block update list");
            plan = BlockPlan::all(self.module.block_count());
        }

        self.goto_state(BurnState::Updating);
        self.observer.on_event(&UpdateEvent::ModuleStarted {
            module: self.module.name.clone(),
            pending: plan.pending_count(),
            total: plan.len(),
        });
        self.open_session()?;
        let blocks_written = self.transfer(payload, &plan, progress)?;

        self.goto_state(BurnState::Verifying);
        let remaining = self.query_block_plan(VERIFY_TIMEOUT, false)?;
        if !remaining.is_complete() {
            return Err(UpdateError::Integrity(format!(
                "update failed: {} blocks of {} did not verify",
                remaining.pending_count(),
                self.module.name
            )));
        }

        self.activate()?;
        info!(module = %self.module.name, blocks_written, "Update finished");
        Ok(BurnOutcome::Burned { blocks_written })
    }

    fn query_block_plan(&mut self, timeout: Duration, force_full: bool) -> Result<BlockPlan> {
        self.link.send_command(&Command::QueryBlocks {
            module: self.module.name.clone(),
        })?;
        let scan = self.link.wait_for(MARKER_DLINFO_END, timeout)?;
        debug!("dlinfo response:\n{}", scan.text());
        let plan = plan_blocks(self.module, scan.text(), force_full);
        self.link.consume(scan);
        Ok(plan)
    }

    fn open_session(&mut self) -> Result<()> {
        let module = self.module;
        self.link.send_command(&Command::BeginModule {
            module: module.name.clone(),
            version: module.version.clone(),
            size: module.size as u32,
            first: self.options.is_first,
            crc: module.crc,
            block_size: self.options.block_size,
        })?;

        // The error marker arrives shortly after the ack.
        let scan = self.link.settle(DLINIT_SETTLE)?;
        let refused = scan.contains(MARKER_DLINIT_ERROR);
        debug!("dlinit response:\n{}", scan.text());
        self.link.consume(scan);
        if refused {
            error!(module = %module.name, "dlinit returned err, closing session");
            self.link.send_command(&Command::Activate {
                final_activation: true,
            })?;
            return Err(UpdateError::Protocol("dlinit returned err".into()));
        }

        self.link.send_binary(&module.block_crc_table())?;
        let scan = self.link.snapshot();
        self.link.consume(scan);
        Ok(())
    }

    fn transfer(
        &mut self,
        payload: &[u8],
        plan: &BlockPlan,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<usize> {
        let module = self.module;
        let result_timeout = block_result_timeout(self.options.block_size);
        let mut written = 0;

        for (index, block) in module.blocks.iter().enumerate() {
            if !plan.is_pending(index) {
                debug!(module = %module.name, block = index, "Block already up to date");
                progress.tick();
                continue;
            }

            self.link.send_command(&Command::BeginBlock { index })?;
            let scan = self.link.wait_idle()?;
            let acked = scan.contains(&block_ack_line(&module.name, index, block.crc_len));
            if !acked {
                debug!("Missing block ack, response:\n{}", scan.text());
            }
            self.link.consume(scan);
            if !acked {
                return Err(UpdateError::Protocol(format!(
                    "did not receive ack for block {} of {}",
                    index, module.name
                )));
            }

            let data = block.data(payload).ok_or_else(|| {
                UpdateError::Validation(format!(
                    "payload of {} too short for block {}",
                    module.name, index
                ))
            })?;
            self.link.send_binary(data)?;

            let scan = self.link.wait_for(MARKER_BLOCK_RESULT, result_timeout)?;
            let code = parse_block_result(scan.text());
            self.link.consume(scan);
            match code {
                Some(0) => {}
                Some(code) => {
                    return Err(UpdateError::Protocol(format!(
                        "block {} of {} rejected with code {}",
                        index, module.name, code
                    )));
                }
                None => {
                    return Err(UpdateError::Protocol(format!(
                        "malformed result for block {} of {}",
                        index, module.name
                    )));
                }
            }

            written += 1;
            self.observer.on_event(&UpdateEvent::BlockWritten {
                module: module.name.clone(),
                index,
                size: data.len(),
            });
            progress.tick();
        }
        Ok(written)
    }

    fn activate(&mut self) -> Result<()> {
        self.goto_state(BurnState::Activating);
        if self.options.is_last {
            // The device reboots right away; stop reading before it does.
            self.link.stop_reader();
            self.link.send_command(&Command::Activate {
                final_activation: true,
            })?;
        } else {
            self.link.send_command(&Command::Activate {
                final_activation: false,
            })?;
            let scan = self.link.wait_for(MARKER_VALIDATION_OK, ACTIVATION_TIMEOUT)?;
            self.link.consume(scan);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::NullObserver;
    use crate::payload::{FirmwareModule, page_aligned, segment};
    use crate::transport::mock::Outgoing;
    use crate::transport::{MockBlock, MockLink};
    use std::path::PathBuf;

    const BLOCK: u32 = 4096;

    fn module(name: &str, blocks: usize) -> (FirmwareModule, Vec<u8>) {
        sized_module(name, blocks * BLOCK as usize, BLOCK)
    }

    /// Module of `size` bytes, padded with zeros to a whole page.
    fn sized_module(name: &str, size: usize, block_size: u32) -> (FirmwareModule, Vec<u8>) {
        let aligned_size = page_aligned(size);
        let mut buffer: Vec<u8> = (0..aligned_size).map(|i| (i % 251) as u8).collect();
        buffer[size..].fill(0);
        let module = FirmwareModule {
            name: name.into(),
            version: "1.0.0".into(),
            crc: crate::crc::crc32(0, &buffer[..crate::crc::crc_aligned(size)]),
            source_file: PathBuf::new(),
            file_offset: 0,
            size,
            aligned_size,
            blocks: segment(&buffer, size, block_size as usize),
        };
        (module, buffer)
    }

    fn options(is_last: bool) -> BurnOptions {
        BurnOptions {
            is_first: true,
            is_last,
            force_full: false,
            block_size: BLOCK,
        }
    }

    fn burn(
        mock: &mut MockLink,
        module: &FirmwareModule,
        payload: &[u8],
        options: BurnOptions,
    ) -> (Result<BurnOutcome>, usize) {
        let mut ticks = 0;
        let mut sink = |_: f32| ticks += 1;
        let result = {
            let mut progress = ProgressTracker::new(module.block_count(), &mut sink);
            ModuleBurner::new(mock, &NullObserver, module, options).run(payload, &mut progress)
        };
        (result, ticks)
    }

    #[test]
    fn test_parse_block_result() {
        assert_eq!(parse_block_result("dl ack\ndl ret=0\n"), Some(0));
        assert_eq!(parse_block_result("dl ret=-3\r\n"), Some(-3));
        assert_eq!(parse_block_result("dl ret= 0\n"), Some(0));
        assert_eq!(parse_block_result("dl ret=  -5"), Some(-5));
        assert_eq!(parse_block_result("dl ret=x"), None);
        assert_eq!(parse_block_result("nothing"), None);
    }

    #[test]
    fn test_skip_active_module() {
        let (m, payload) = module("DNET", 3);
        let mut mock = MockLink::new();
        mock.install_verified(&m, BLOCK, ModuleState::Active);

        let (result, ticks) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap(), BurnOutcome::Skipped);
        assert_eq!(ticks, 3);
        assert!(mock.block_writes().is_empty());
        assert!(!mock.commands().iter().any(|c| c.verb() == "dlinit"));
    }

    #[test]
    fn test_skip_last_module_activates_final() {
        let (m, payload) = module("OPFW", 2);
        let mut mock = MockLink::new();
        mock.install_verified(&m, BLOCK, ModuleState::Active);

        let (result, _) = burn(&mut mock, &m, &payload, options(true));
        assert_eq!(result.unwrap(), BurnOutcome::Skipped);
        assert!(!mock.reader_running());
        assert_eq!(
            mock.commands().last(),
            Some(&Command::Activate {
                final_activation: true
            })
        );
        assert!(mock.rebooted());
    }

    #[test]
    fn test_matching_but_pending_module_is_rewritten() {
        let (m, payload) = module("DNET", 2);
        let mut mock = MockLink::new();
        mock.install_verified(&m, BLOCK, ModuleState::Pending);

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap(), BurnOutcome::Burned { blocks_written: 2 });
        assert_eq!(mock.block_writes(), vec![0, 1]);
        assert_eq!(mock.module("DNET").unwrap().state, ModuleState::Active);
    }

    #[test]
    fn test_resume_active_updating() {
        let (m, payload) = module("RECOG", 5);
        let mut mock = MockLink::new();
        mock.install_verified(&m, BLOCK, ModuleState::ActiveUpdating);
        mock.set_block("RECOG", 2, None);
        mock.set_block(
            "RECOG",
            3,
            Some(MockBlock {
                status: "ERR".into(),
                hdr_crc: m.blocks[3].crc,
                real_crc: 0,
            }),
        );
        mock.set_block("RECOG", 4, None);

        let (result, ticks) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap(), BurnOutcome::Burned { blocks_written: 3 });
        assert_eq!(mock.block_writes(), vec![2, 3, 4]);
        assert_eq!(ticks, 5);
    }

    #[test]
    fn test_unaligned_module_sends_word_aligned_tail() {
        // 20000 bytes in 8192 byte blocks: the last block spans 4096 bytes
        // of the page but only 3616 bytes of data.
        let block_size = 8192;
        let (m, payload) = sized_module("DNET", 20000, block_size);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        let options = BurnOptions {
            block_size,
            ..options(false)
        };

        let (result, ticks) = burn(&mut mock, &m, &payload, options);
        assert_eq!(result.unwrap(), BurnOutcome::Burned { blocks_written: 3 });
        assert_eq!(ticks, 3);

        let sends: Vec<usize> = mock
            .outgoing()
            .iter()
            .filter_map(|o| match o {
                Outgoing::Binary(len) => Some(*len),
                Outgoing::Command(_) => None,
            })
            .collect();
        assert_eq!(sends, vec![12, 8192, 8192, 3616]);
        assert!(mock.transcript().contains("DNET : blk 2 sz=3616"));

        let stored = mock.module("DNET").unwrap();
        assert_eq!(stored.state, ModuleState::Active);
        assert_eq!(stored.blocks[2], Some(MockBlock::ok(m.blocks[2].crc)));
    }

    #[test]
    fn test_missing_block_result_is_timeout() {
        let (m, payload) = module("DNET", 3);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.silent_block_result(1);

        let (result, ticks) = burn(&mut mock, &m, &payload, options(false));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("dl ret="));
        assert_eq!(mock.block_writes(), vec![0, 1]);
        assert_eq!(ticks, 1);
    }

    #[test]
    fn test_dlinit_error_closes_session() {
        let (m, payload) = module("DNET", 1);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.fail_dlinit();

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(
            mock.commands().last(),
            Some(&Command::Activate {
                final_activation: true
            })
        );
        assert!(mock.block_writes().is_empty());
    }

    #[test]
    fn test_missing_block_ack() {
        let (m, payload) = module("DNET", 2);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.mute_block_ack();

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("ack"));
        assert_eq!(mock.block_writes(), vec![0]);
    }

    #[test]
    fn test_rejected_block() {
        let (m, payload) = module("DNET", 3);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.reject_block(1);

        let (result, ticks) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(mock.block_writes(), vec![0, 1]);
        assert_eq!(ticks, 1);
    }

    #[test]
    fn test_corrupt_block_fails_verification() {
        let (m, payload) = module("DNET", 3);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.corrupt_block(2);

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
        assert!(
            !mock
                .commands()
                .iter()
                .any(|c| matches!(c, Command::Activate { .. }))
        );
    }

    #[test]
    fn test_missing_validation_is_timeout() {
        let (m, payload) = module("DNET", 1);
        let mut mock = MockLink::new();
        mock.install_module("DNET", "0.0.0.0", ModuleState::Empty);
        mock.silent_activation();

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_unknown_module_is_device_state_error() {
        let (m, payload) = module("DNET", 1);
        let mut mock = MockLink::new();
        mock.install_module("OPFW", "1.0.0", ModuleState::Active);

        let (result, _) = burn(&mut mock, &m, &payload, options(false));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::DeviceState);
    }
}
