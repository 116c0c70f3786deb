//! Shared test utilities for flowtap core integration tests.
//!
//! Provides a scripted device connector, cache-output builders and a
//! reachability check for the opt-in live router tests.

// Each integration test is compiled as its own crate, so not every test file
// uses every function from this shared module. Suppress dead_code warnings.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowtap_core::config::{CollectorConfig, DeviceConfig, MonitorSource, StoreConfig, TimezoneConfig};
use flowtap_core::device::{DeviceConnector, DeviceSession};
use flowtap_core::errors::SessionError;
use flowtap_core::sink::{FallbackLog, FlowStore, IngestionSink};

/// Header of a typical IOS-XE flow-monitor cache dump.
pub const CACHE_HEADER: &str = "IPV4 SRC ADDR  IPV4 DST ADDR  TRNS SRC PORT  TRNS DST PORT  IP PROT  tcp flags  bytes long  pkts long  time first    time last";

/// Build a cache dump with a preamble, the header, a rule line and `rows`.
pub fn cache_output(rows: &[&str]) -> String {
    let mut out = String::from(
        "  Cache type:                               Normal (Platform cache)\n  \
         Cache size:                                  10000\n  \
         Current entries:                                 1\n\n",
    );
    out.push_str(CACHE_HEADER);
    out.push('\n');
    out.push_str("=============  =============  =============  =============  =======  =========  ==========  =========  ===========  ===========\n");
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out
}

/// What a scripted monitor answers.
#[derive(Clone)]
pub enum Script {
    Output(String),
    Unreachable,
}

/// Connector whose sessions answer per monitor name from a script.
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    commands_per_session: Option<usize>,
    pub opened: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.to_string(), script))
                .collect(),
            commands_per_session: None,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every session refuse commands after the first `limit`, like a
    /// router that closes the connection after one exec.
    pub fn commands_per_session(mut self, limit: usize) -> Self {
        self.commands_per_session = Some(limit);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    scripts: HashMap<String, Script>,
    remaining: Option<usize>,
}

impl DeviceSession for ScriptedSession {
    fn run_command(&mut self, command: &str) -> Result<String, SessionError> {
        match self.remaining.as_mut() {
            Some(0) => {
                return Err(SessionError::CommandFailed {
                    command: command.to_string(),
                    reason: "channel open failed".into(),
                })
            }
            Some(n) => *n -= 1,
            None => {}
        }
        let monitor = command
            .strip_prefix("show flow monitor ")
            .and_then(|rest| rest.strip_suffix(" cache"))
            .unwrap_or(command);
        match self.scripts.get(monitor) {
            Some(Script::Output(text)) => Ok(text.clone()),
            Some(Script::Unreachable) => Err(SessionError::DeviceUnreachable(format!(
                "session dropped while reading {monitor}"
            ))),
            None => Ok(format!("% Flow Monitor: '{monitor}' does not exist\n")),
        }
    }
}

impl DeviceConnector for ScriptedConnector {
    fn open(&self) -> Result<Box<dyn DeviceSession>, SessionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            scripts: self.scripts.clone(),
            remaining: self.commands_per_session,
        }))
    }

    fn cache_command(&self, monitor: &MonitorSource) -> String {
        format!("show flow monitor {} cache", monitor.name())
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Collector config for `monitors` with UTC device/reference clocks.
pub fn collector_config(monitors: &[&str]) -> CollectorConfig {
    CollectorConfig {
        device: DeviceConfig {
            host: "192.0.2.1".into(),
            username: "netops".into(),
            password: Some("secret".into()),
            ..Default::default()
        },
        monitors: monitors.iter().map(|m| m.to_string()).collect(),
        poll_interval_secs: 60,
        workers: 1,
        timezones: TimezoneConfig::default(),
        store: StoreConfig {
            url: "postgres://localhost/flows".into(),
            ..Default::default()
        },
        fallback_log: String::new(),
    }
}

pub fn sink(store: Arc<dyn FlowStore>, dir: &tempfile::TempDir) -> Arc<IngestionSink> {
    Arc::new(IngestionSink::new(
        store,
        FallbackLog::new(dir.path().join("flows_log.jsonl")),
        Duration::from_secs(5),
    ))
}

/// Check if a TCP port is reachable on the given host.
///
/// Returns `true` if a TCP connection can be established within 2 seconds.
pub fn is_port_reachable(host: &str, port: u16) -> bool {
    use std::net::ToSocketAddrs;
    match (host, port).to_socket_addrs().map(|mut a| a.next()) {
        Ok(Some(addr)) => TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok(),
        _ => false,
    }
}

/// Device settings for the live router tests, from `FLOWTAP_TEST_*` env vars.
pub fn live_device() -> Option<(DeviceConfig, String)> {
    let host = std::env::var("FLOWTAP_TEST_HOST").ok()?;
    let config = DeviceConfig {
        host,
        port: std::env::var("FLOWTAP_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(22),
        username: std::env::var("FLOWTAP_TEST_USERNAME").unwrap_or_default(),
        password: std::env::var("FLOWTAP_TEST_PASSWORD").ok(),
        ..Default::default()
    };
    let monitor = std::env::var("FLOWTAP_TEST_MONITOR").ok()?;
    Some((config, monitor))
}

/// Skip the current test unless a live router is configured and reachable.
///
/// Prints a message to stderr and returns early (runtime check instead of
/// `#[ignore]`).
macro_rules! require_device {
    () => {
        match common::live_device() {
            Some((config, monitor)) if common::is_port_reachable(&config.host, config.port) => {
                (config, monitor)
            }
            _ => {
                eprintln!(
                    "SKIPPED: no reachable router \
                     (set FLOWTAP_TEST_HOST, FLOWTAP_TEST_USERNAME, FLOWTAP_TEST_PASSWORD, FLOWTAP_TEST_MONITOR)"
                );
                return;
            }
        }
    };
}
pub(crate) use require_device;
