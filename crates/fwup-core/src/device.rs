//! Device module table discovery.
//!
//! The device answers `dlver` with one line per module:
//!
//! ```text
//! OPFW : [OPFW] [6.2.0.1] (active)
//! ```
//!
//! Module state is never cached; every caller queries the device again.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, instrument};

use crate::error::{Result, UpdateError};
use crate::protocol::Command;
use crate::protocol::constants::{SCRAP, VERSION_SETTLE};
use crate::transport::DeviceLink;

/// Lifecycle state of a module as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Empty,
    Active,
    /// A previous update of this module was interrupted mid transfer.
    ActiveUpdating,
    Pending,
}

impl ModuleState {
    /// Literal used by the device.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Empty => "empty",
            ModuleState::Active => "active",
            ModuleState::ActiveUpdating => "active-updating",
            ModuleState::Pending => "pending",
        }
    }
}

impl FromStr for ModuleState {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        [
            ModuleState::Empty,
            ModuleState::Active,
            ModuleState::ActiveUpdating,
            ModuleState::Pending,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
        .ok_or_else(|| UpdateError::Protocol(format!("unknown module state \"{}\"", s)))
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the device's module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceModuleState {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Take the text between `open` and `close` at the start of `s`.
fn bracketed(s: &str, open: char, close: char) -> Option<(&str, &str)> {
    let rest = s.strip_prefix(open)?;
    let end = rest.find(close)?;
    Some((&rest[..end], &rest[end + close.len_utf8()..]))
}

/// Parse one module table line.
///
/// Returns `Ok(None)` for lines that do not have the table shape. A line with
/// the right shape but disagreeing names or an unknown state is an error.
pub fn parse_module_line(line: &str) -> Result<Option<DeviceModuleState>> {
    let Some(sep) = line.find(" : [") else {
        return Ok(None);
    };

    let head = &line[..sep];
    let name_start = head
        .char_indices()
        .rev()
        .take_while(|&(_, c)| is_word(c))
        .last()
        .map(|(i, _)| i);
    let Some(name_start) = name_start else {
        return Ok(None);
    };
    let name = &head[name_start..];

    let rest = &line[sep + 3..];
    let Some((inner_name, rest)) = bracketed(rest, '[', ']') else {
        return Ok(None);
    };
    let Some((version, rest)) = rest.strip_prefix(' ').and_then(|r| bracketed(r, '[', ']')) else {
        return Ok(None);
    };
    let Some((state, _)) = rest.strip_prefix(' ').and_then(|r| bracketed(r, '(', ')')) else {
        return Ok(None);
    };

    if inner_name.is_empty() || !inner_name.chars().all(is_word) {
        return Ok(None);
    }
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Ok(None);
    }
    if state.is_empty() || !state.chars().all(|c| is_word(c) || c == '-') {
        return Ok(None);
    }

    if name != inner_name {
        return Err(UpdateError::Protocol(format!(
            "module table line names disagree: {} vs {}",
            name, inner_name
        )));
    }

    Ok(Some(DeviceModuleState {
        name: name.to_string(),
        version: version.to_string(),
        state: state.parse()?,
    }))
}

/// Parse a full `dlver` response. The bookkeeping module is left out.
pub fn parse_module_table(text: &str) -> Result<Vec<DeviceModuleState>> {
    let mut modules = Vec::new();
    for line in text.lines() {
        if let Some(module) = parse_module_line(line)? {
            debug!(name = %module.name, version = %module.version, state = %module.state, "Device module");
            if module.name != SCRAP {
                modules.push(module);
            }
        }
    }
    Ok(modules)
}

/// Query the device's module table.
#[instrument(skip(link))]
pub fn query_modules<L: DeviceLink + ?Sized>(link: &mut L) -> Result<Vec<DeviceModuleState>> {
    link.send_command(&Command::QueryVersions)?;
    let scan = link.settle(VERSION_SETTLE)?;
    let parsed = parse_module_table(scan.text());
    link.consume(scan);

    let modules = parsed?;
    if modules.is_empty() {
        return Err(UpdateError::DeviceState(
            "could not extract module list from dlver response".into(),
        ));
    }
    Ok(modules)
}

/// Query the device's module table and pick out `name`.
pub fn query_module<L: DeviceLink + ?Sized>(link: &mut L, name: &str) -> Result<DeviceModuleState> {
    query_modules(link)?
        .into_iter()
        .find(|m| m.name == name)
        .ok_or_else(|| UpdateError::DeviceState(format!("module not found in device: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::MockLink;

    #[test]
    fn test_parse_line() {
        let m = parse_module_line("OPFW : [OPFW] [6.2.0.1] (active-updating)")
            .unwrap()
            .unwrap();
        assert_eq!(m.name, "OPFW");
        assert_eq!(m.version, "6.2.0.1");
        assert_eq!(m.state, ModuleState::ActiveUpdating);
    }

    #[test]
    fn test_parse_line_with_log_prefix() {
        let m = parse_module_line("[00:01.234] DNET : [DNET] [1.0] (pending)\r")
            .unwrap()
            .unwrap();
        assert_eq!(m.name, "DNET");
        assert_eq!(m.state, ModuleState::Pending);
    }

    #[test]
    fn test_noise_lines_are_skipped() {
        for line in [
            "",
            "dlver ack",
            "OPFW : active",
            "OPFW : [OPFW] [v1] (active)",
            "OPFW : [OPFW] [1.0]",
        ] {
            assert!(parse_module_line(line).unwrap().is_none(), "{line:?}");
        }
    }

    #[test]
    fn test_unknown_state_is_protocol_error() {
        let err = parse_module_line("OPFW : [OPFW] [1.0] (broken)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_name_mismatch_is_protocol_error() {
        let err = parse_module_line("OPFW : [DNET] [1.0] (active)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_state_literals_round_trip() {
        for state in [
            ModuleState::Empty,
            ModuleState::Active,
            ModuleState::ActiveUpdating,
            ModuleState::Pending,
        ] {
            assert_eq!(state.as_str().parse::<ModuleState>().unwrap(), state);
        }
    }

    #[test]
    fn test_table_excludes_scrap() {
        let text = "dlver ack\n\
                    OPFW : [OPFW] [6.2.0.1] (active)\n\
                    SCRAP : [SCRAP] [0.0.0.1] (active)\n\
                    SPOOFS : [SPOOFS] [1.4.0] (empty)\n";
        let modules = parse_module_table(text).unwrap();
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["OPFW", "SPOOFS"]);
    }

    #[test]
    fn test_query_modules() {
        let mut mock = MockLink::new();
        mock.install_module("OPFW", "6.2.0.1", ModuleState::Active);
        mock.install_module("DNET", "1.0.0", ModuleState::ActiveUpdating);

        let modules = query_modules(&mut mock).unwrap();
        assert_eq!(modules.len(), 2);
        assert!(mock.snapshot().is_empty());

        let dnet = query_module(&mut mock, "DNET").unwrap();
        assert_eq!(dnet.state, ModuleState::ActiveUpdating);

        let err = query_module(&mut mock, "YOLO").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceState);
    }

    #[test]
    fn test_query_modules_requires_a_module() {
        let mut mock = MockLink::new();
        mock.install_module("OPFW", "6.2.0.1", ModuleState::Active);
        mock.report_no_modules();
        let err = query_modules(&mut mock).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceState);
    }
}
