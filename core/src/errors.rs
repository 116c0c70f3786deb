//! Error types for the flowtap core crate.
//!
//! Each pipeline stage has its own enum so callers can tell a skipped
//! monitor (parse/session) from a batch that went to the fallback log
//! (store). Row-level faults are never errors; they are counted instead.

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The cache dump could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The device session failed to open or run a command.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The time-series store rejected or failed a write.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The durable fallback log could not be written or read.
    #[error("Fallback log error: {0}")]
    Fallback(#[from] FallbackError),

    /// A configuration error (missing connection parameters, bad values).
    #[error("Config error: {0}")]
    Config(String),

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while locating the flow table in raw CLI output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No line of the output carried both address column labels.
    #[error("Flow cache header not found in output of monitor '{0}'")]
    HeaderNotFound(String),
}

/// Errors related to the remote CLI session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// TCP connect, handshake or authentication failed.
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The session was open but the command could not be executed or read.
    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },
}

/// Errors related to writing flow rows to the time-series store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not take the batch at all.
    #[error("Store write failed: {0}")]
    WriteFailure(String),

    /// The write did not complete within the configured timeout.
    #[error("Store write timed out after {0} ms")]
    Timeout(u64),

    /// The store accepted some rows and rejected others.
    #[error("Store rejected {} of {} rows (indices {:?})", .rejected.len(), .accepted + .rejected.len(), .rejected)]
    PartialBatchRejection {
        accepted: usize,
        rejected: Vec<usize>,
    },
}

/// Errors from the durable fallback log.
#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
