use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A remote peripheral as seen by the platform stack.
///
/// Captured once (on scan match or from an externally supplied address) and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Platform address, e.g. `AA:BB:CC:DD:EE:FF`
    pub address: String,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Name to show for this device, falling back to its address
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.address,
        }
    }
}

/// Criteria a discovered device must satisfy to be accepted by a scan.
///
/// Every populated field must match. Names match exactly, addresses match
/// case-insensitively. An empty filter accepts the first device seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl ScanFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: None,
        }
    }

    pub fn by_address(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: Some(address.into()),
        }
    }

    pub fn matches(&self, device: &DeviceIdentity) -> bool {
        let name_ok = match &self.name {
            Some(wanted) => device.name.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        let address_ok = match &self.address {
            Some(wanted) => device.address.eq_ignore_ascii_case(wanted),
            None => true,
        };
        name_ok && address_ok
    }
}

/// A service/characteristic pair to subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// How the string event is derived from a notification payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextDecoding {
    /// Decode the whole payload, flag byte included
    #[default]
    FullBuffer,
    /// Decode only the bytes following the flag byte
    AfterFlag,
}

/// GATT status code as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure (GATT_FAILURE)
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound events, one per named signal of the host bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
pub enum LinkEvent {
    ConnectionStateChanged(bool),
    SubscriptionError(String),
    SubscriptionSuccess(String),
    ServicesDiscovered(String),
    ButtonStateChanged(bool),
    ButtonStateString(String),
    ScanFailed(i32),
    DeviceFound(String),
}

impl LinkEvent {
    pub fn signal_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged(_) => "connection_state_changed",
            Self::SubscriptionError(_) => "subscription_error",
            Self::SubscriptionSuccess(_) => "subscription_success",
            Self::ServicesDiscovered(_) => "services_discovered",
            Self::ButtonStateChanged(_) => "button_state_changed",
            Self::ButtonStateString(_) => "button_state_string",
            Self::ScanFailed(_) => "scan_failed",
            Self::DeviceFound(_) => "device_found",
        }
    }
}
