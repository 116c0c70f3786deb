//! SSH device sessions over libssh2.
//!
//! A session is one interactive shell on a PTY, the same way an operator
//! would use the router CLI. The prompt is learned from the login banner,
//! paging is switched off, and each command's output is read until the
//! prompt comes back. `ssh2::Session::set_timeout` bounds the banner
//! exchange, handshake and authentication during [`SshConnector::open`],
//! and then every read of the shell.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{DeviceConfig, MonitorSource};
use crate::errors::{CoreError, SessionError};

use super::{DeviceConnector, DeviceKind, DeviceSession};

/// Wide enough that cache rows are never wrapped by the device.
const PTY_COLUMNS: u32 = 511;
const PTY_ROWS: u32 = 24;

/// Opens SSH sessions to one router.
pub struct SshConnector {
    config: DeviceConfig,
    kind: DeviceKind,
}

impl SshConnector {
    pub fn new(config: DeviceConfig) -> Result<Self, CoreError> {
        let kind = config.device_type.parse()?;
        Ok(Self { config, kind })
    }
}

impl DeviceConnector for SshConnector {
    fn open(&self) -> Result<Box<dyn DeviceSession>, SessionError> {
        let session = connect_and_authenticate(&self.config)?;
        let command_timeout = Duration::from_millis(self.config.command_timeout_ms);
        let shell = SshSession::start(session, self.kind, command_timeout)?;
        debug!(
            "SSH shell established to {}@{} (prompt {:?})",
            self.config.username, self.config.host, shell.prompt
        );
        Ok(Box::new(shell))
    }

    fn cache_command(&self, monitor: &MonitorSource) -> String {
        self.kind.cache_command(monitor)
    }

    fn describe(&self) -> String {
        format!(
            "{}@{}:{}",
            self.config.username, self.config.host, self.config.port
        )
    }
}

/// An interactive shell on an authenticated SSH session, in blocking mode.
pub struct SshSession {
    channel: ssh2::Channel,
    session: ssh2::Session,
    prompt: String,
    command_timeout: Duration,
}

// ssh2::Session contains raw pointers but is safe to send between
// threads when access is serialized (one worker slot owns each session).
unsafe impl Send for SshSession {}

impl SshSession {
    /// Open the shell, wait for the first prompt and turn off paging.
    fn start(
        session: ssh2::Session,
        kind: DeviceKind,
        command_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let unreachable = SessionError::DeviceUnreachable;

        let mut channel = session
            .channel_session()
            .map_err(|e| unreachable(format!("Channel open failed: {e}")))?;
        channel
            .request_pty("vt100", None, Some((PTY_COLUMNS, PTY_ROWS, 0, 0)))
            .map_err(|e| unreachable(format!("PTY request failed: {e}")))?;
        channel
            .shell()
            .map_err(|e| unreachable(format!("Shell request failed: {e}")))?;

        let banner = read_until(&mut channel, command_timeout, |text| {
            detect_prompt(text).is_some()
        })
        .map_err(|e| unreachable(format!("No CLI prompt: {e}")))?;
        let prompt = detect_prompt(&banner)
            .map(str::to_string)
            .ok_or_else(|| unreachable("No CLI prompt".to_string()))?;

        let mut shell = Self {
            channel,
            session,
            prompt,
            command_timeout,
        };
        shell
            .run_command(kind.disable_paging_command())
            .map_err(|e| unreachable(e.to_string()))?;
        Ok(shell)
    }
}

impl DeviceSession for SshSession {
    fn run_command(&mut self, command: &str) -> Result<String, SessionError> {
        let failed = |reason: String| SessionError::CommandFailed {
            command: command.to_string(),
            reason,
        };

        self.channel
            .write_all(format!("{command}\n").as_bytes())
            .and_then(|_| self.channel.flush())
            .map_err(|e| failed(format!("write failed: {e}")))?;

        let prompt = self.prompt.clone();
        let raw = read_until(&mut self.channel, self.command_timeout, |text| {
            strip_prompt(text, &prompt).is_some()
        })
        .map_err(|e| failed(format!("read failed: {e}")))?;

        command_output(&raw, command, &self.prompt)
            .ok_or_else(|| failed("prompt not found in output".to_string()))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.channel.close().ok();
        self.session
            .disconnect(None, "poll cycle complete", None)
            .ok();
    }
}

/// Read from `channel` until `done` accepts everything read so far.
fn read_until(
    channel: &mut ssh2::Channel,
    timeout: Duration,
    mut done: impl FnMut(&str) -> bool,
) -> std::io::Result<String> {
    let deadline = Instant::now() + timeout;
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = channel.read(&mut buf)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "shell closed by device",
            ));
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if done(&*text) {
            return Ok(text.into_owned());
        }
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "prompt did not return in time",
            ));
        }
    }
}

/// The CLI prompt (`Router#`, `edge-1>`) if `text` currently ends with one.
fn detect_prompt(text: &str) -> Option<&str> {
    let last = text.rsplit(['\n', '\r']).next()?.trim();
    let body = last.strip_suffix('#').or_else(|| last.strip_suffix('>'))?;
    (!body.is_empty() && !body.contains(char::is_whitespace)).then_some(last)
}

/// Everything before `prompt` if `text` ends with it.
fn strip_prompt<'a>(text: &'a str, prompt: &str) -> Option<&'a str> {
    text.trim_end().strip_suffix(prompt)
}

/// A command's output: the echoed command line and the trailing prompt are
/// removed and line endings normalized.
fn command_output(raw: &str, command: &str, prompt: &str) -> Option<String> {
    let body = strip_prompt(raw, prompt)?.replace("\r\n", "\n").replace('\r', "");
    let body = match body.split_once('\n') {
        Some((first, rest)) if first.trim_end().ends_with(command) => rest.to_string(),
        _ => body,
    };
    Some(body)
}

/// Connect to the device, perform handshake, and authenticate.
///
/// Returns an authenticated `Session` in blocking mode whose timeout is the
/// configured command timeout.
fn connect_and_authenticate(config: &DeviceConfig) -> Result<ssh2::Session, SessionError> {
    let unreachable = SessionError::DeviceUnreachable;
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| unreachable(format!("Cannot resolve {}: {e}", config.host)))?
        .next()
        .ok_or_else(|| unreachable(format!("No address for {}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| unreachable(format!("Connection to {addr} failed: {e}")))?;

    let mut session =
        ssh2::Session::new().map_err(|e| unreachable(format!("Session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session.set_blocking(true);
    session.set_timeout(saturating_ms(config.connect_timeout_ms));
    session
        .handshake()
        .map_err(|e| unreachable(format!("Handshake failed: {e}")))?;

    match config.auth_method.as_str() {
        "agent" => {
            session
                .userauth_agent(&config.username)
                .map_err(|e| unreachable(format!("Agent auth failed: {e}")))?;
        }
        "key" => {
            let key_path = config
                .key_path
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("~/.ssh/id_rsa");
            let expanded = crate::config::expand::expand_tilde(key_path);
            session
                .userauth_pubkey_file(
                    &config.username,
                    None,
                    Path::new(&expanded),
                    config.password.as_deref(),
                )
                .map_err(|e| unreachable(format!("Key auth failed: {e}")))?;
        }
        _ => {
            let password = config.password.as_deref().unwrap_or("");
            session
                .userauth_password(&config.username, password)
                .map_err(|e| unreachable(format!("Password auth failed: {e}")))?;
        }
    }

    if !session.authenticated() {
        return Err(unreachable("Authentication failed".to_string()));
    }

    session.set_timeout(saturating_ms(config.command_timeout_ms));
    Ok(session)
}

fn saturating_ms(ms: u64) -> u32 {
    u32::try_from(ms).unwrap_or(u32::MAX)
}
