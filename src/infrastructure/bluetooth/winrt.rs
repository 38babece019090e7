//! WinRT BLE Adapter
//!
//! [`BleAdapter`] on top of `Windows.Devices.Bluetooth`. Every platform call
//! that has to be awaited runs as a task on the link runtime and reports its
//! outcome through the adapter event channel.

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, BleAdapter, CharacteristicRef, ConnectionHandle,
    DescriptorRef, GattStatus, ServiceRef,
};
use crate::infrastructure::bluetooth::protocol::{self, CLIENT_CHARACTERISTIC_CONFIG};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError,
    BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn platform(e: windows::core::Error) -> LinkError {
    LinkError::Platform(e.message().to_string())
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut value = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut value)?;
    Ok(value)
}

struct CharacteristicEntry {
    characteristic: GattCharacteristic,
    descriptors: HashSet<Uuid>,
}

struct ServiceEntry {
    _service: GattDeviceService,
    characteristics: HashMap<Uuid, CharacteristicEntry>,
}

/// Platform objects held for one [`ConnectionHandle`]
#[derive(Default)]
struct WinConnection {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    status_token: Option<i64>,
    services: HashMap<Uuid, ServiceEntry>,
    value_tokens: HashMap<CharacteristicRef, i64>,
}

impl WinConnection {
    fn characteristic(&self, characteristic: &CharacteristicRef) -> Option<&CharacteristicEntry> {
        self.services
            .get(&characteristic.service)?
            .characteristics
            .get(&characteristic.uuid)
    }

    fn release(mut self) {
        for (target, token) in std::mem::take(&mut self.value_tokens) {
            if let Some(entry) = self.characteristic(&target) {
                let _ = entry.characteristic.RemoveValueChanged(token);
            }
        }
        if let Some(session) = self.session.take() {
            let _ = session.SetMaintainConnection(false);
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            if let Some(token) = self.status_token.take() {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            let _ = device.Close();
        }
    }
}

type Connections = Arc<Mutex<HashMap<ConnectionHandle, WinConnection>>>;

fn lock(connections: &Connections) -> MutexGuard<'_, HashMap<ConnectionHandle, WinConnection>> {
    connections
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WinRtAdapter {
    runtime: Handle,
    events: AdapterEventSender,
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    connections: Connections,
    next_handle: AtomicU64,
}

impl WinRtAdapter {
    /// Bind to the default Bluetooth adapter.
    ///
    /// Must be called from within the runtime that will drive the link.
    pub async fn new(events: AdapterEventSender) -> LinkResult<Self> {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(operation) => operation.await,
            Err(e) => Err(e),
        };
        match adapter {
            Ok(adapter) if adapter.IsLowEnergySupported().unwrap_or(false) => {
                info!("Bluetooth adapter ready");
            }
            Ok(_) => {
                error!("Bluetooth adapter does not support Low Energy");
                return Err(LinkError::AdapterUnavailable);
            }
            Err(e) => {
                error!("No Bluetooth adapter: {}", e.message());
                return Err(LinkError::AdapterUnavailable);
            }
        }

        Ok(Self {
            runtime: Handle::current(),
            events,
            watcher: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
        })
    }

    fn watcher(&self) -> MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_watcher(&self) -> windows::core::Result<BluetoothLEAdvertisementWatcher> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.events.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let device = DeviceIdentity::new(
                        protocol::format_address(args.BluetoothAddress()?),
                        (!name.is_empty()).then_some(name),
                    );
                    let _ = sender.send(AdapterEvent::DeviceFound(device));
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let sender = self.events.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let status = args.Error()?;
                    if status != BluetoothError::Success {
                        let _ = sender.send(AdapterEvent::ScanFailed { code: status.0 });
                    }
                }
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        Ok(watcher)
    }
}

/// Open the device and keep its GATT session alive
async fn open_session(
    handle: ConnectionHandle,
    address: u64,
    connections: &Connections,
    events: &AdapterEventSender,
) -> windows::core::Result<()> {
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
    let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
    session.SetMaintainConnection(true)?;

    let sender = events.clone();
    let status_handler =
        TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                let connected = dev.ConnectionStatus()? == BluetoothConnectionStatus::Connected;
                let _ = sender.send(AdapterEvent::ConnectionStateChanged {
                    handle,
                    connected,
                    status: GattStatus::SUCCESS,
                });
            }
            Ok(())
        });
    let token = device.ConnectionStatusChanged(&status_handler)?;
    let connected = device.ConnectionStatus()? == BluetoothConnectionStatus::Connected;

    {
        let mut connections = lock(connections);
        let Some(connection) = connections.get_mut(&handle) else {
            debug!(handle = %handle, "Connection closed while opening");
            let _ = device.RemoveConnectionStatusChanged(token);
            let _ = session.Close();
            let _ = device.Close();
            return Ok(());
        };
        connection.device = Some(device);
        connection.session = Some(session);
        connection.status_token = Some(token);
    }

    // Otherwise the status handler reports the link once it comes up
    if connected {
        let _ = events.send(AdapterEvent::ConnectionStateChanged {
            handle,
            connected: true,
            status: GattStatus::SUCCESS,
        });
    }
    Ok(())
}

async fn load_services(
    device: &BluetoothLEDevice,
) -> windows::core::Result<Result<HashMap<Uuid, ServiceEntry>, GattStatus>> {
    let result = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    if result.Status()? != GattCommunicationStatus::Success {
        return Ok(Err(GattStatus(result.Status()?.0)));
    }

    let mut table = HashMap::new();
    let services = result.Services()?;
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let characteristics_result = service.GetCharacteristicsAsync()?.await?;
        if characteristics_result.Status()? != GattCommunicationStatus::Success {
            warn!("Characteristics of {} unavailable", to_uuid(service.Uuid()?));
            continue;
        }

        let mut characteristics = HashMap::new();
        let list = characteristics_result.Characteristics()?;
        for j in 0..list.Size()? {
            let characteristic = list.GetAt(j)?;
            let mut descriptors = HashSet::new();
            let descriptors_result = characteristic.GetDescriptorsAsync()?.await?;
            if descriptors_result.Status()? == GattCommunicationStatus::Success {
                let found = descriptors_result.Descriptors()?;
                for k in 0..found.Size()? {
                    descriptors.insert(to_uuid(found.GetAt(k)?.Uuid()?));
                }
            }
            characteristics.insert(
                to_uuid(characteristic.Uuid()?),
                CharacteristicEntry {
                    characteristic,
                    descriptors,
                },
            );
        }

        table.insert(
            to_uuid(service.Uuid()?),
            ServiceEntry {
                _service: service,
                characteristics,
            },
        );
    }
    Ok(Ok(table))
}

impl BleAdapter for WinRtAdapter {
    fn start_scan(&self, _duration: Duration) -> LinkResult<()> {
        let mut slot = self.watcher();
        if let Some(previous) = slot.take() {
            let _ = previous.Stop();
        }

        let watcher = self.create_watcher().map_err(platform)?;
        watcher.Start().map_err(|e| {
            warn!("Advertisement watcher refused to start: {}", e.message());
            LinkError::ScanFailed { code: e.code().0 }
        })?;
        *slot = Some(watcher);
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(watcher) = self.watcher().take() {
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e.message());
            }
        }
    }

    fn remote_device(&self, address: &str) -> Option<DeviceIdentity> {
        let address = protocol::parse_address(address)?;
        Some(DeviceIdentity::new(protocol::format_address(address), None))
    }

    fn connect(&self, device: &DeviceIdentity) -> LinkResult<ConnectionHandle> {
        let address = protocol::parse_address(&device.address)
            .ok_or_else(|| LinkError::DeviceNotFound(device.address.clone()))?;
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.connections).insert(handle, WinConnection::default());

        let connections = self.connections.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = open_session(handle, address, &connections, &events).await {
                warn!(handle = %handle, "Failed to open GATT session: {}", e.message());
                let _ = events.send(AdapterEvent::ConnectionStateChanged {
                    handle,
                    connected: false,
                    status: GattStatus::FAILURE,
                });
            }
        });
        Ok(handle)
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        if let Some(session) = lock(&self.connections)
            .get(&handle)
            .and_then(|connection| connection.session.as_ref())
        {
            let _ = session.SetMaintainConnection(false);
        }
    }

    fn close(&self, handle: ConnectionHandle) {
        if let Some(connection) = lock(&self.connections).remove(&handle) {
            debug!(handle = %handle, "Releasing GATT session");
            connection.release();
        }
    }

    fn discover_services(&self, handle: ConnectionHandle) -> LinkResult<()> {
        let device = lock(&self.connections)
            .get(&handle)
            .and_then(|connection| connection.device.clone())
            .ok_or(LinkError::NotConnected)?;

        let connections = self.connections.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let status = match load_services(&device).await {
                Ok(Ok(table)) => match lock(&connections).get_mut(&handle) {
                    Some(connection) => {
                        connection.services = table;
                        GattStatus::SUCCESS
                    }
                    None => return,
                },
                Ok(Err(status)) => status,
                Err(e) => {
                    warn!(handle = %handle, "Service discovery failed: {}", e.message());
                    GattStatus::FAILURE
                }
            };
            let _ = events.send(AdapterEvent::ServicesDiscovered { handle, status });
        });
        Ok(())
    }

    fn get_service(&self, handle: ConnectionHandle, uuid: Uuid) -> Option<ServiceRef> {
        lock(&self.connections)
            .get(&handle)?
            .services
            .contains_key(&uuid)
            .then_some(ServiceRef {
                connection: handle,
                uuid,
            })
    }

    fn get_characteristic(&self, service: &ServiceRef, uuid: Uuid) -> Option<CharacteristicRef> {
        lock(&self.connections)
            .get(&service.connection)?
            .services
            .get(&service.uuid)?
            .characteristics
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
        lock(&self.connections)
            .get(&characteristic.connection)?
            .characteristic(characteristic)?
            .descriptors
            .contains(&uuid)
            .then(|| DescriptorRef {
                characteristic: characteristic.clone(),
                uuid,
            })
    }

    fn enable_notifications(
        &self,
        characteristic: &CharacteristicRef,
        enable: bool,
    ) -> LinkResult<()> {
        let mut connections = lock(&self.connections);
        let connection = connections
            .get_mut(&characteristic.connection)
            .ok_or(LinkError::NotConnected)?;
        let gatt = connection
            .characteristic(characteristic)
            .ok_or(LinkError::CharacteristicNotFound(characteristic.uuid))?
            .characteristic
            .clone();

        if let Some(token) = connection.value_tokens.remove(characteristic) {
            let _ = gatt.RemoveValueChanged(token);
        }
        if !enable {
            return Ok(());
        }

        let sender = self.events.clone();
        let target = characteristic.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(AdapterEvent::CharacteristicChanged {
                        characteristic: target.clone(),
                        value,
                    });
                }
                Ok(())
            },
        );
        let token = gatt.ValueChanged(&handler).map_err(platform)?;
        connection
            .value_tokens
            .insert(characteristic.clone(), token);
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &DescriptorRef, value: &[u8]) -> LinkResult<()> {
        if descriptor.uuid != CLIENT_CHARACTERISTIC_CONFIG {
            return Err(LinkError::Platform(format!(
                "Writing descriptor {} is not supported",
                descriptor.uuid
            )));
        }

        let gatt = lock(&self.connections)
            .get(&descriptor.characteristic.connection)
            .and_then(|connection| connection.characteristic(&descriptor.characteristic))
            .map(|entry| entry.characteristic.clone())
            .ok_or(LinkError::CharacteristicNotFound(descriptor.characteristic.uuid))?;

        let config = match value.first() {
            Some(0x01) => GattClientCharacteristicConfigurationDescriptorValue::Notify,
            Some(0x02) => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
            _ => GattClientCharacteristicConfigurationDescriptorValue::None,
        };
        let operation = gatt
            .WriteClientCharacteristicConfigurationDescriptorAsync(config)
            .map_err(platform)?;

        let characteristic = descriptor.characteristic.uuid;
        self.runtime.spawn(async move {
            match operation.await {
                Ok(status) if status == GattCommunicationStatus::Success => {
                    debug!(%characteristic, "Client configuration written");
                }
                Ok(status) => {
                    warn!(%characteristic, "Client configuration write returned {:?}", status);
                }
                Err(e) => {
                    warn!(%characteristic, "Client configuration write failed: {}", e.message());
                }
            }
        });
        Ok(())
    }
}

impl Drop for WinRtAdapter {
    fn drop(&mut self) {
        self.stop_scan();
        let connections: Vec<_> = lock(&self.connections).drain().collect();
        for (_, connection) in connections {
            connection.release();
        }
    }
}
