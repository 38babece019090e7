//! In-memory adapter
//!
//! Records every request the link issues and answers lookups from a
//! configurable GATT table. With [`FakeAdapter::auto_respond`] it also plays
//! the platform side of connect and discovery, which makes whole sessions
//! reproducible without a radio.

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, BleAdapter, CharacteristicRef, ConnectionHandle,
    DescriptorRef, GattStatus, ServiceRef,
};
use crate::infrastructure::bluetooth::protocol::{self, CLIENT_CHARACTERISTIC_CONFIG};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

/// A request the link issued to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterRequest {
    StartScan,
    StopScan,
    Connect(DeviceIdentity, ConnectionHandle),
    Disconnect(ConnectionHandle),
    Close(ConnectionHandle),
    DiscoverServices(ConnectionHandle),
    EnableNotifications(CharacteristicRef, bool),
    WriteDescriptor(DescriptorRef, Vec<u8>),
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    scan_error: Option<i32>,
    connect_error: Option<String>,
    auto_discovery: Option<GattStatus>,
    // service -> characteristic -> has a CCCD
    table: HashMap<Uuid, HashMap<Uuid, bool>>,
    open: HashSet<ConnectionHandle>,
    requests: Vec<AdapterRequest>,
}

pub struct FakeAdapter {
    events: AdapterEventSender,
    state: Mutex<FakeState>,
}

impl FakeAdapter {
    pub fn new(events: AdapterEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the recorded requests
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Expose `characteristic` under `service` after discovery
    pub fn add_characteristic(&self, service: Uuid, characteristic: Uuid, has_cccd: bool) {
        self.state()
            .table
            .entry(service)
            .or_default()
            .insert(characteristic, has_cccd);
    }

    /// Answer connect requests with `Connected` and discovery requests with
    /// `discovery_status`
    pub fn auto_respond(&self, discovery_status: GattStatus) {
        self.state().auto_discovery = Some(discovery_status);
    }

    pub fn fail_scan_start(&self, code: i32) {
        self.state().scan_error = Some(code);
    }

    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.state().connect_error = Some(reason.into());
    }

    /// Deliver an event as if the platform produced it
    pub fn inject(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn requests(&self) -> Vec<AdapterRequest> {
        self.state().requests.clone()
    }

    /// Sessions connected but not closed yet
    pub fn open_sessions(&self) -> Vec<ConnectionHandle> {
        let mut open: Vec<_> = self.state().open.iter().copied().collect();
        open.sort_by_key(|handle| handle.0);
        open
    }

    fn record(&self, request: AdapterRequest) {
        trace!("Fake adapter request: {:?}", request);
        self.state().requests.push(request);
    }
}

impl BleAdapter for FakeAdapter {
    fn start_scan(&self, _duration: Duration) -> LinkResult<()> {
        if let Some(code) = self.state().scan_error {
            return Err(LinkError::ScanFailed { code });
        }
        self.record(AdapterRequest::StartScan);
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(AdapterRequest::StopScan);
    }

    fn remote_device(&self, address: &str) -> Option<DeviceIdentity> {
        let address = protocol::parse_address(address)?;
        Some(DeviceIdentity::new(protocol::format_address(address), None))
    }

    fn connect(&self, device: &DeviceIdentity) -> LinkResult<ConnectionHandle> {
        let (handle, auto) = {
            let mut state = self.state();
            if let Some(reason) = state.connect_error.clone() {
                return Err(LinkError::Platform(reason));
            }
            state.next_handle += 1;
            let handle = ConnectionHandle(state.next_handle);
            state.open.insert(handle);
            (handle, state.auto_discovery.is_some())
        };
        self.record(AdapterRequest::Connect(device.clone(), handle));

        if auto {
            self.inject(AdapterEvent::ConnectionStateChanged {
                handle,
                connected: true,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(handle)
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        self.record(AdapterRequest::Disconnect(handle));
    }

    fn close(&self, handle: ConnectionHandle) {
        self.state().open.remove(&handle);
        self.record(AdapterRequest::Close(handle));
    }

    fn discover_services(&self, handle: ConnectionHandle) -> LinkResult<()> {
        self.record(AdapterRequest::DiscoverServices(handle));
        let auto = self.state().auto_discovery;
        if let Some(status) = auto {
            self.inject(AdapterEvent::ServicesDiscovered { handle, status });
        }
        Ok(())
    }

    fn get_service(&self, handle: ConnectionHandle, uuid: Uuid) -> Option<ServiceRef> {
        let state = self.state();
        (state.open.contains(&handle) && state.table.contains_key(&uuid)).then(|| ServiceRef {
            connection: handle,
            uuid,
        })
    }

    fn get_characteristic(&self, service: &ServiceRef, uuid: Uuid) -> Option<CharacteristicRef> {
        let state = self.state();
        state
            .table
            .get(&service.uuid)?
            .contains_key(&uuid)
            .then(|| CharacteristicRef {
                connection: service.connection,
                service: service.uuid,
                uuid,
            })
    }

    fn get_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        uuid: Uuid,
    ) -> Option<DescriptorRef> {
        if uuid != CLIENT_CHARACTERISTIC_CONFIG {
            return None;
        }
        let state = self.state();
        let has_cccd = *state
            .table
            .get(&characteristic.service)?
            .get(&characteristic.uuid)?;
        has_cccd.then(|| DescriptorRef {
            characteristic: characteristic.clone(),
            uuid,
        })
    }

    fn enable_notifications(
        &self,
        characteristic: &CharacteristicRef,
        enable: bool,
    ) -> LinkResult<()> {
        self.record(AdapterRequest::EnableNotifications(
            characteristic.clone(),
            enable,
        ));
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &DescriptorRef, value: &[u8]) -> LinkResult<()> {
        self.record(AdapterRequest::WriteDescriptor(
            descriptor.clone(),
            value.to_vec(),
        ));
        Ok(())
    }
}
