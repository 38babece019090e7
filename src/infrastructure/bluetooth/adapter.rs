//! BLE Adapter Capability
//!
//! The seam between the link core and a platform BLE stack. Requests are
//! fire-and-forget: they return as soon as the platform accepted them and the
//! outcome is delivered later as an [`AdapterEvent`] on the channel the
//! adapter was constructed with.

use crate::domain::error::LinkResult;
pub use crate::domain::models::GattStatus;
use crate::domain::models::DeviceIdentity;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one platform GATT session.
///
/// Handles are never reused by an adapter, so an event carrying a stale
/// handle can always be told apart from one for the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A service resolved against a connection's discovery table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub connection: ConnectionHandle,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub connection: ConnectionHandle,
    pub service: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    pub characteristic: CharacteristicRef,
    pub uuid: Uuid,
}

/// Asynchronous callbacks delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    DeviceFound(DeviceIdentity),
    /// The platform aborted a running scan
    ScanFailed { code: i32 },
    ConnectionStateChanged {
        handle: ConnectionHandle,
        connected: bool,
        status: GattStatus,
    },
    ServicesDiscovered {
        handle: ConnectionHandle,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
}

impl AdapterEvent {
    /// Connection the event belongs to, if any
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            Self::ConnectionStateChanged { handle, .. } | Self::ServicesDiscovered { handle, .. } => {
                Some(*handle)
            }
            Self::CharacteristicChanged { characteristic, .. } => Some(characteristic.connection),
            Self::DeviceFound(_) | Self::ScanFailed { .. } => None,
        }
    }
}

pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// Platform BLE stack as consumed by the link core.
///
/// Lookups are synchronous and answer from the table cached by the last
/// successful service discovery of the given connection.
pub trait BleAdapter: Send + Sync {
    /// Begin delivering [`AdapterEvent::DeviceFound`]. A platform refusal is
    /// returned as `LinkError::ScanFailed`.
    fn start_scan(&self, duration: Duration) -> LinkResult<()>;

    fn stop_scan(&self);

    /// Resolve an externally supplied address into a device identity
    fn remote_device(&self, address: &str) -> Option<DeviceIdentity>;

    /// Issue a connect request. The result arrives as
    /// [`AdapterEvent::ConnectionStateChanged`] for the returned handle.
    fn connect(&self, device: &DeviceIdentity) -> LinkResult<ConnectionHandle>;

    fn disconnect(&self, handle: ConnectionHandle);

    /// Release every platform resource held for `handle`
    fn close(&self, handle: ConnectionHandle);

    fn discover_services(&self, handle: ConnectionHandle) -> LinkResult<()>;

    fn get_service(&self, handle: ConnectionHandle, uuid: Uuid) -> Option<ServiceRef>;

    fn get_characteristic(&self, service: &ServiceRef, uuid: Uuid) -> Option<CharacteristicRef>;

    fn get_descriptor(&self, characteristic: &CharacteristicRef, uuid: Uuid)
        -> Option<DescriptorRef>;

    /// Toggle local delivery of value updates for `characteristic`
    fn enable_notifications(&self, characteristic: &CharacteristicRef, enable: bool)
        -> LinkResult<()>;

    fn write_descriptor(&self, descriptor: &DescriptorRef, value: &[u8]) -> LinkResult<()>;
}

macro_rules! forward_adapter {
    ($($wrapper:ident)::+) => {
        impl<A: BleAdapter + ?Sized> BleAdapter for $($wrapper)::+<A> {
            fn start_scan(&self, duration: Duration) -> LinkResult<()> {
                (**self).start_scan(duration)
            }

            fn stop_scan(&self) {
                (**self).stop_scan()
            }

            fn remote_device(&self, address: &str) -> Option<DeviceIdentity> {
                (**self).remote_device(address)
            }

            fn connect(&self, device: &DeviceIdentity) -> LinkResult<ConnectionHandle> {
                (**self).connect(device)
            }

            fn disconnect(&self, handle: ConnectionHandle) {
                (**self).disconnect(handle)
            }

            fn close(&self, handle: ConnectionHandle) {
                (**self).close(handle)
            }

            fn discover_services(&self, handle: ConnectionHandle) -> LinkResult<()> {
                (**self).discover_services(handle)
            }

            fn get_service(&self, handle: ConnectionHandle, uuid: Uuid) -> Option<ServiceRef> {
                (**self).get_service(handle, uuid)
            }

            fn get_characteristic(&self, service: &ServiceRef, uuid: Uuid) -> Option<CharacteristicRef> {
                (**self).get_characteristic(service, uuid)
            }

            fn get_descriptor(
                &self,
                characteristic: &CharacteristicRef,
                uuid: Uuid,
            ) -> Option<DescriptorRef> {
                (**self).get_descriptor(characteristic, uuid)
            }

            fn enable_notifications(
                &self,
                characteristic: &CharacteristicRef,
                enable: bool,
            ) -> LinkResult<()> {
                (**self).enable_notifications(characteristic, enable)
            }

            fn write_descriptor(&self, descriptor: &DescriptorRef, value: &[u8]) -> LinkResult<()> {
                (**self).write_descriptor(descriptor, value)
            }
        }
    };
}

// Lets the host keep a handle on the adapter the link loop owns
forward_adapter!(std::sync::Arc);
forward_adapter!(Box);
