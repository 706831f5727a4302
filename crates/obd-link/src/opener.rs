//! RFCOMM channel opening

use crate::device::DeviceRef;
use obd_protocol::DuplexStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use uuid::Uuid;

/// Link security requested for an RFCOMM channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSecurity {
    /// Authenticated and encrypted
    Secure,
    /// No link-level security, for clones that reject secure pairing
    Insecure,
}

/// Platform hook that opens a connected RFCOMM byte stream.
///
/// An implementation must release anything it half-opened before returning
/// an error.
pub trait RfcommOpener: Send + Sync {
    type Stream: DuplexStream + 'static;

    /// Whether `device` is paired with this host
    fn is_bonded(&self, device: &DeviceRef) -> bool {
        let _ = device;
        true
    }

    /// Open and connect one channel to `service` on `device`
    fn open(
        &self,
        device: &DeviceRef,
        service: Uuid,
        security: ChannelSecurity,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}
