//! Bluetooth link to an ELM327 adapter
//!
//! Establishes the RFCOMM transport with retry and fallback, then runs the
//! adapter handshake and polling loop from `obd-protocol` and
//! `obd-scheduler` under a single [`LinkSession`].

mod connector;
mod device;
mod error;
mod opener;
mod serial;
mod session;

pub use connector::{ConnectConfig, DeviceConnector};
pub use device::{sort_by_likelihood, DeviceRef, OBD_NAME_HINTS, SPP_UUID};
pub use error::{ConnectionError, SessionError};
pub use opener::{ChannelSecurity, RfcommOpener};
pub use serial::{SerialOpener, DEFAULT_BAUD_RATE};
pub use session::{LinkSession, LinkStarted, SessionConfig};
