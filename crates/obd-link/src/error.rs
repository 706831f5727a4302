//! Link Error Types

use obd_protocol::HandshakeError;
use obd_scheduler::{LinkStatus, SchedulerError};
use thiserror::Error;

/// The transport could not be established
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("max_retries must be at least 1")]
    InvalidRetryCount,

    #[error("Device {0} is not bonded")]
    NotBonded(String),

    #[error("Could not connect to {address} after {attempts} attempts: {source}")]
    Exhausted {
        address: String,
        attempts: u32,
        source: std::io::Error,
    },
}

/// Setup or teardown of a link session failed
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl SessionError {
    /// Status shown to a collaborator when a session call fails
    pub fn status(&self) -> LinkStatus {
        match self {
            SessionError::Connection(_) | SessionError::Handshake(_) => LinkStatus::Rejected,
            SessionError::Scheduler(_) => LinkStatus::ConnectionProblems,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::ObdProtocol;

    #[test]
    fn test_setup_failures_are_rejections() {
        let err = SessionError::from(ConnectionError::InvalidRetryCount);
        assert_eq!(err.status(), LinkStatus::Rejected);

        let err = SessionError::from(HandshakeError::NoProtocol {
            tried: vec![ObdProtocol::Auto],
        });
        assert_eq!(err.status(), LinkStatus::Rejected);
    }

    #[test]
    fn test_exhausted_message() {
        let err = ConnectionError::Exhausted {
            address: "AA:BB".to_string(),
            attempts: 4,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "page timeout"),
        };
        assert_eq!(
            err.to_string(),
            "Could not connect to AA:BB after 4 attempts: page timeout"
        );
    }
}
