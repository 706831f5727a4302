//! Bonded device references

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard Serial Port Profile service class
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

/// Name fragments that usually mean an OBD-II adapter
pub const OBD_NAME_HINTS: [&str; 7] = ["obdii", "elm327", "obd2", "v-link", "vgate", "scanner", "car"];

/// A paired adapter and the services worth trying on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    address: String,
    name: Option<String>,
    /// Tried in order; always ends with [`SPP_UUID`]
    service_ids: Vec<Uuid>,
}

impl DeviceRef {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            service_ids: vec![SPP_UUID],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Put a service found by SDP discovery ahead of the SPP default
    pub fn with_discovered_service(mut self, service: Uuid) -> Self {
        self.service_ids.retain(|id| *id != service);
        self.service_ids.insert(0, service);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn service_ids(&self) -> &[Uuid] {
        &self.service_ids
    }

    /// Service to connect to when the caller has no preference
    pub fn preferred_service(&self) -> Uuid {
        self.service_ids.first().copied().unwrap_or(SPP_UUID)
    }

    /// Name-based guess at whether this is an OBD-II adapter
    pub fn is_probably_obd_adapter(&self) -> bool {
        match &self.name {
            Some(name) => {
                let name = name.to_lowercase();
                OBD_NAME_HINTS.iter().any(|hint| name.contains(hint))
            }
            None => false,
        }
    }

    /// Name if known, address otherwise
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.address),
            None => self.address.clone(),
        }
    }
}

/// Order devices so likely adapters come first, otherwise keeping input order
pub fn sort_by_likelihood(devices: &mut [DeviceRef]) {
    devices.sort_by_key(|device| !device.is_probably_obd_adapter());
}
