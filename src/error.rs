//! Relay error types
//!
//! `SshError` is what transports, handshakes and routers report. `RelayError` is what a
//! proxied session ends with, tagged by the phase that failed.

use std::fmt;

use thiserror::Error;

use crate::relay::Direction;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer reached end of stream.
    #[error("Disconnected")]
    Disconnected,

    /// The session was closed locally, usually by the opposite pump.
    #[error("Session closed")]
    SessionClosed,

    #[error("Cancelled")]
    Cancelled,
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<serde_json::Error> for SshError {
    fn from(err: serde_json::Error) -> Self {
        SshError::Config(err.to_string())
    }
}

/// Phase of a proxied session in which it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Upstream,
    Route,
    Downstream,
    Relay,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("upstream handshake failed: {0}")]
    Upstream(#[source] SshError),

    #[error("routing failed: {0}")]
    Route(#[source] SshError),

    #[error("ssh: handshake failed with {addr}: {source}")]
    Downstream {
        addr: String,
        #[source]
        source: SshError,
    },

    #[error("{0}")]
    Relay(#[source] PumpErrors),
}

impl RelayError {
    pub fn phase(&self) -> Phase {
        match self {
            RelayError::Upstream(_) => Phase::Upstream,
            RelayError::Route(_) => Phase::Route,
            RelayError::Downstream { .. } => Phase::Downstream,
            RelayError::Relay(_) => Phase::Relay,
        }
    }

    /// Pump outcomes, if the session made it to the relay phase.
    pub fn pump_errors(&self) -> Option<&PumpErrors> {
        match self {
            RelayError::Relay(errors) => Some(errors),
            _ => None,
        }
    }
}

/// Which half of a forwarding step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOp {
    Read,
    Write,
    /// The pump task itself failed (panicked); which I/O step it was in is unknown
    Task,
}

impl fmt::Display for PumpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpOp::Read => f.write_str("read"),
            PumpOp::Write => f.write_str("write"),
            PumpOp::Task => f.write_str("task"),
        }
    }
}

/// Terminal outcome of one pump task.
#[derive(Error, Debug)]
#[error("{direction} {op} failed: {source}")]
pub struct PumpError {
    pub direction: Direction,
    pub op: PumpOp,
    #[source]
    pub source: SshError,
}

impl PumpError {
    pub fn read(direction: Direction, source: SshError) -> Self {
        Self {
            direction,
            op: PumpOp::Read,
            source,
        }
    }

    pub fn write(direction: Direction, source: SshError) -> Self {
        Self {
            direction,
            op: PumpOp::Write,
            source,
        }
    }

    pub fn task(direction: Direction, source: SshError) -> Self {
        Self {
            direction,
            op: PumpOp::Task,
            source,
        }
    }
}

/// Outcomes of both pump tasks, kept together.
///
/// Only one of them usually caused the teardown; the other is the failure induced by the
/// forced close. Both are preserved for diagnostics.
#[derive(Debug, Default)]
pub struct PumpErrors {
    errors: Vec<PumpError>,
}

impl PumpErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: PumpError) {
        self.errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PumpError> {
        self.errors.iter()
    }

    pub fn get(&self, direction: Direction) -> Option<&PumpError> {
        self.errors.iter().find(|e| e.direction == direction)
    }

    pub fn into_vec(self) -> Vec<PumpError> {
        self.errors
    }
}

impl fmt::Display for PumpErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for PumpErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl IntoIterator for PumpErrors {
    type Item = PumpError;
    type IntoIter = std::vec::IntoIter<PumpError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
