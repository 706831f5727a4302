//! RFCOMM over a bound serial tty
//!
//! On Linux a bonded adapter is typically exposed as `/dev/rfcommN` after
//! `rfcomm bind`. The kernel owns security there, so the requested level is
//! only logged.

use crate::device::DeviceRef;
use crate::opener::{ChannelSecurity, RfcommOpener};
use std::collections::HashMap;
use std::io;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;
use uuid::Uuid;

/// ELM327 clones default to this rate on their SPP side
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Opens the tty bound to each known device address
#[derive(Debug, Clone)]
pub struct SerialOpener {
    ports: HashMap<String, String>,
    baud_rate: u32,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl SerialOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            ports: HashMap::new(),
            baud_rate,
        }
    }

    /// Register the tty bound to `address`
    pub fn with_port(mut self, address: impl Into<String>, path: impl Into<String>) -> Self {
        self.ports.insert(address.into(), path.into());
        self
    }

    pub fn port_for(&self, address: &str) -> Option<&str> {
        self.ports.get(address).map(String::as_str)
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl RfcommOpener for SerialOpener {
    type Stream = SerialStream;

    /// Only devices with a bound tty count as bonded
    fn is_bonded(&self, device: &DeviceRef) -> bool {
        self.ports.contains_key(device.address())
    }

    async fn open(
        &self,
        device: &DeviceRef,
        service: Uuid,
        security: ChannelSecurity,
    ) -> io::Result<SerialStream> {
        let path = self.port_for(device.address()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no tty bound for {}", device.address()),
            )
        })?;
        debug!(
            "Opening {} at {} baud for {} ({:?}, service {})",
            path, self.baud_rate, device.address(), security, service
        );
        let stream = tokio_serial::new(path, self.baud_rate).open_native_async()?;
        Ok(stream)
    }
}
