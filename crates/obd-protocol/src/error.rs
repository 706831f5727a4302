//! OBD-II Error Types

use crate::initializer::AdapterState;
use crate::protocol::ObdProtocol;
use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// Serial channel I/O error
    #[error("Serial channel error: {0}")]
    SerialError(String),

    /// No prompt within the wait window, and nothing received
    #[error("Timeout waiting for OBD response after {0}ms")]
    CommandTimeout(u64),

    /// The connection was closed or the peer hung up
    #[error("Connection closed")]
    ConnectionClosed,

    /// Reply did not decode for the requested PID
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Adapter never reached the ready state
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Polling gave up after too many consecutive failures
    #[error("OBD adapter not responding after {0} consecutive failures")]
    AdapterUnresponsive(u32),
}

impl ObdError {
    /// Whether the underlying transport is gone for good
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ObdError::ConnectionClosed)
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => ObdError::ConnectionClosed,
            _ => ObdError::SerialError(err.to_string()),
        }
    }
}

/// A reply that could not be turned into data bytes for a PID
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing came back
    #[error("Empty response")]
    Empty,

    /// Adapter says there is nothing to report
    #[error("Adapter reported {0}")]
    NoData(String),

    /// Header found but too few data bytes followed it
    #[error("PID {pid:02X} frame truncated: expected {expected} data bytes, got {got}")]
    Truncated { pid: u8, expected: usize, got: usize },

    /// No `41 <pid>` header anywhere in the reply
    #[error("No Mode 01 frame for PID {pid:02X} in response")]
    NoMatch { pid: u8 },
}

/// Reasons the adapter initializer failed to reach ready
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Reset never produced an ELM banner
    #[error("Adapter reset banner missing after {attempts} attempts")]
    BannerMissing { attempts: u32 },

    /// Every protocol candidate failed the canary request
    #[error("No protocol candidate answered the canary request (tried {tried:?})")]
    NoProtocol { tried: Vec<ObdProtocol> },

    /// The channel failed underneath a handshake stage
    #[error("Channel failure while {stage}: {source}")]
    Channel {
        stage: AdapterState,
        #[source]
        source: Box<ObdError>,
    },
}

impl HandshakeError {
    pub(crate) fn channel(stage: AdapterState, source: ObdError) -> Self {
        HandshakeError::Channel {
            stage,
            source: Box::new(source),
        }
    }
}
