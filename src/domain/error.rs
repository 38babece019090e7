//! Error taxonomy for the BLE link.
//!
//! Every error is terminal for the operation that produced it only. The link
//! loop reports it once through the event sink and keeps running.

use crate::domain::models::{GattStatus, LinkEvent};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("BLE permissions are not granted.")]
    PermissionDenied,

    #[error("Bluetooth adapter not available")]
    AdapterUnavailable,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Not connected to a BLE device.")]
    NotConnected,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Scan failed with code: {code}")]
    ScanFailed { code: i32 },

    #[error("Service discovery failed with status: {status}")]
    ServiceDiscoveryFailed { status: GattStatus },

    /// Opaque failure reported synchronously by the platform stack
    #[error("Platform error: {0}")]
    Platform(String),
}

impl LinkError {
    /// Map the error onto the outbound signal that reports it.
    ///
    /// Scan failures carry their numeric code; everything else is surfaced as
    /// a subscription error with the human-readable message.
    pub fn into_event(self) -> LinkEvent {
        match self {
            LinkError::ScanFailed { code } => LinkEvent::ScanFailed(code),
            other => LinkEvent::SubscriptionError(other.to_string()),
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
