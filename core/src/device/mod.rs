//! Remote CLI sessions on the router.
//!
//! The scheduler only sees the [`DeviceConnector`] / [`DeviceSession`]
//! traits. Sessions are blocking (the SSH backend is libssh2) and are driven
//! from `spawn_blocking`.

#[cfg(feature = "ssh")]
pub mod ssh;

use std::str::FromStr;

use crate::config::MonitorSource;
use crate::errors::{CoreError, SessionError};

/// CLI flavour of the device, which selects the cache command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    CiscoIos,
    CiscoXe,
    CiscoNxos,
}

impl DeviceKind {
    /// The command that dumps `monitor`'s flow cache.
    pub fn cache_command(&self, monitor: &MonitorSource) -> String {
        match self {
            DeviceKind::CiscoIos | DeviceKind::CiscoXe | DeviceKind::CiscoNxos => {
                format!("show flow monitor {} cache", monitor.name())
            }
        }
    }

    /// Turns off the `--More--` pager for the rest of the session.
    pub fn disable_paging_command(&self) -> &'static str {
        match self {
            DeviceKind::CiscoIos | DeviceKind::CiscoXe | DeviceKind::CiscoNxos => {
                "terminal length 0"
            }
        }
    }
}

impl FromStr for DeviceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cisco_ios" | "ios" => Ok(DeviceKind::CiscoIos),
            "cisco_xe" | "cisco_iosxe" | "iosxe" => Ok(DeviceKind::CiscoXe),
            "cisco_nxos" | "nxos" => Ok(DeviceKind::CiscoNxos),
            other => Err(CoreError::Config(format!("Unsupported device type: {other}"))),
        }
    }
}

/// An open CLI session. Dropping it closes the connection.
pub trait DeviceSession: Send {
    /// Run one command and return its raw output.
    fn run_command(&mut self, command: &str) -> Result<String, SessionError>;
}

/// Opens sessions to the device and knows its command syntax.
pub trait DeviceConnector: Send + Sync {
    /// Open, handshake and authenticate a new session.
    fn open(&self) -> Result<Box<dyn DeviceSession>, SessionError>;

    fn cache_command(&self, monitor: &MonitorSource) -> String;

    /// Label for logs, e.g. `netops@192.0.2.1:22`.
    fn describe(&self) -> String;
}
