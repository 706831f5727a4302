//! OBD-II Polling Loop
//!
//! Repeatedly requests one PID from a ready adapter at a fixed cadence and
//! reports values, degraded cycles and terminal failure over a channel.

mod event;
mod poller;

pub use event::{LinkStatus, PollEvent};
pub use poller::{PollOutcome, Poller, PollerConfig, PollingSession, SchedulerError, StopReason};
