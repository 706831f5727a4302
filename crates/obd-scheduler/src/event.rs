//! What the polling task tells the outside world

use serde::{Deserialize, Serialize};

/// One message from the polling task per cycle, plus a final one on stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollEvent {
    /// A frame for the requested PID decoded
    Value { pid: u8, value: u32, timestamp_ms: u64 },
    /// This cycle failed; polling continues
    Waiting { consecutive_errors: u32 },
    /// Too many consecutive failures; polling has stopped
    Unresponsive { consecutive_errors: u32 },
    /// The transport went away; polling has stopped
    ConnectionLost,
}

impl PollEvent {
    /// No further events follow a terminal one
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollEvent::Unresponsive { .. } | PollEvent::ConnectionLost)
    }

    /// Collapse into the status a presentation layer shows
    pub fn status(&self) -> LinkStatus {
        match self {
            PollEvent::Value { value, .. } => LinkStatus::Reading(*value),
            PollEvent::Waiting { .. } => LinkStatus::WaitingForData,
            PollEvent::Unresponsive { .. } | PollEvent::ConnectionLost => {
                LinkStatus::ConnectionProblems
            }
        }
    }
}

/// Collaborator-facing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Latest decoded value
    Reading(u32),
    /// Degraded: the last cycle produced nothing
    WaitingForData,
    /// Terminal: the link needs to be re-established
    ConnectionProblems,
    /// Setup never completed
    Rejected,
}
