//! Notification subscriptions on the live connection.

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::{LinkEvent, SubscriptionTarget};
use crate::infrastructure::bluetooth::adapter::{CharacteristicRef, ConnectionHandle};
use crate::infrastructure::bluetooth::connection::{ConnectionState, DiscoveryPhase};
use crate::infrastructure::bluetooth::context::LinkContext;
use crate::infrastructure::bluetooth::protocol::{
    CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Characteristics with notifications enabled, valid for one connection only
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    connection: Option<ConnectionHandle>,
    enabled: HashSet<SubscriptionTarget>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        target: SubscriptionTarget,
        state: &ConnectionState,
        ctx: &LinkContext<'_>,
    ) -> LinkResult<()> {
        ctx.require_permissions()?;

        let handle = match state {
            ConnectionState::Open {
                handle,
                phase: DiscoveryPhase::Ready,
                ..
            } => *handle,
            // The table of a failed discovery is never trusted
            ConnectionState::Open {
                phase: DiscoveryPhase::Failed(_),
                ..
            } => return Err(LinkError::ServiceNotFound(target.service)),
            _ => return Err(LinkError::NotConnected),
        };

        let service = ctx
            .adapter
            .get_service(handle, target.service)
            .ok_or(LinkError::ServiceNotFound(target.service))?;
        let characteristic = ctx
            .adapter
            .get_characteristic(&service, target.characteristic)
            .ok_or(LinkError::CharacteristicNotFound(target.characteristic))?;

        ctx.adapter.enable_notifications(&characteristic, true)?;
        match ctx
            .adapter
            .get_descriptor(&characteristic, CLIENT_CHARACTERISTIC_CONFIG)
        {
            Some(descriptor) => ctx
                .adapter
                .write_descriptor(&descriptor, &ENABLE_NOTIFICATION_VALUE)?,
            None => warn!(
                characteristic = %target.characteristic,
                "No client configuration descriptor, relying on local notification delivery"
            ),
        }

        if self.connection != Some(handle) {
            self.invalidate();
            self.connection = Some(handle);
        }
        self.enabled.insert(target);

        info!(handle = %handle, characteristic = %target.characteristic, "Subscribed to characteristic");
        ctx.emit(LinkEvent::SubscriptionSuccess(
            "Subscribed to characteristic.".to_string(),
        ));
        Ok(())
    }

    pub fn is_subscribed(&self, characteristic: &CharacteristicRef) -> bool {
        self.connection == Some(characteristic.connection)
            && self.enabled.contains(&SubscriptionTarget {
                service: characteristic.service,
                characteristic: characteristic.uuid,
            })
    }

    /// Drop every subscription whose connection is no longer the live one
    pub fn sync_with(&mut self, live: Option<ConnectionHandle>) {
        if self.connection.is_some() && self.connection != live {
            self.invalidate();
        }
    }

    pub fn invalidate(&mut self) {
        if !self.enabled.is_empty() {
            debug!(count = self.enabled.len(), "Dropping subscriptions of closed connection");
        }
        self.connection = None;
        self.enabled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceIdentity;
    use crate::infrastructure::bluetooth::adapter::{BleAdapter, DescriptorRef, GattStatus};
    use crate::infrastructure::bluetooth::fake::{AdapterRequest, FakeAdapter};
    use crate::infrastructure::bluetooth::permissions::AlwaysGranted;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
    const CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

    fn target() -> SubscriptionTarget {
        SubscriptionTarget {
            service: SERVICE,
            characteristic: CHARACTERISTIC,
        }
    }

    fn open(handle: ConnectionHandle, phase: DiscoveryPhase) -> ConnectionState {
        ConnectionState::Open {
            handle,
            device: DeviceIdentity::new("AA:AA:AA:AA:AA:AA", None),
            phase,
        }
    }

    /// Adapter with one live session whose handle is returned
    fn connected_adapter(
        has_cccd: bool,
    ) -> (
        FakeAdapter,
        ConnectionHandle,
        mpsc::UnboundedSender<LinkEvent>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (adapter_tx, _) = mpsc::unbounded_channel();
        let adapter = FakeAdapter::new(adapter_tx);
        adapter.add_characteristic(SERVICE, CHARACTERISTIC, has_cccd);
        let handle = adapter
            .connect(&DeviceIdentity::new("AA:AA:AA:AA:AA:AA", None))
            .unwrap();
        let (sink, events) = mpsc::unbounded_channel();
        (adapter, handle, sink, events)
    }

    fn writes(adapter: &FakeAdapter) -> usize {
        adapter
            .requests()
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    AdapterRequest::WriteDescriptor(..) | AdapterRequest::EnableNotifications(..)
                )
            })
            .count()
    }

    #[test]
    fn test_subscribe_writes_cccd() {
        let (adapter, handle, sink, mut events) = connected_adapter(true);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();

        manager
            .subscribe(target(), &open(handle, DiscoveryPhase::Ready), &ctx)
            .unwrap();

        let characteristic = CharacteristicRef {
            connection: handle,
            service: SERVICE,
            uuid: CHARACTERISTIC,
        };
        let requests = adapter.requests();
        assert!(requests.contains(&AdapterRequest::EnableNotifications(
            characteristic.clone(),
            true
        )));
        assert!(requests.contains(&AdapterRequest::WriteDescriptor(
            DescriptorRef {
                characteristic: characteristic.clone(),
                uuid: CLIENT_CHARACTERISTIC_CONFIG,
            },
            vec![0x01, 0x00]
        )));
        assert!(manager.is_subscribed(&characteristic));
        assert_eq!(
            events.try_recv().unwrap(),
            LinkEvent::SubscriptionSuccess("Subscribed to characteristic.".to_string())
        );
    }

    #[test]
    fn test_missing_cccd_still_succeeds() {
        let (adapter, handle, sink, mut events) = connected_adapter(false);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();

        manager
            .subscribe(target(), &open(handle, DiscoveryPhase::Ready), &ctx)
            .unwrap();

        assert!(!adapter
            .requests()
            .iter()
            .any(|r| matches!(r, AdapterRequest::WriteDescriptor(..))));
        assert!(matches!(
            events.try_recv().unwrap(),
            LinkEvent::SubscriptionSuccess(_)
        ));
    }

    #[test]
    fn test_not_ready_is_not_connected() {
        let (adapter, handle, sink, _events) = connected_adapter(true);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();

        for state in [
            ConnectionState::Idle,
            ConnectionState::Closed,
            ConnectionState::Connecting {
                handle,
                device: DeviceIdentity::new("AA:AA:AA:AA:AA:AA", None),
            },
            open(handle, DiscoveryPhase::Discovering),
        ] {
            assert_eq!(
                manager.subscribe(target(), &state, &ctx),
                Err(LinkError::NotConnected)
            );
        }
        assert_eq!(writes(&adapter), 0);
    }

    #[test]
    fn test_unknown_service_and_characteristic() {
        let (adapter, handle, sink, _events) = connected_adapter(true);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();
        let state = open(handle, DiscoveryPhase::Ready);
        let unknown = Uuid::from_u128(0x1234);

        assert_eq!(
            manager.subscribe(
                SubscriptionTarget {
                    service: unknown,
                    characteristic: CHARACTERISTIC
                },
                &state,
                &ctx
            ),
            Err(LinkError::ServiceNotFound(unknown))
        );
        assert_eq!(
            manager.subscribe(
                SubscriptionTarget {
                    service: SERVICE,
                    characteristic: unknown
                },
                &state,
                &ctx
            ),
            Err(LinkError::CharacteristicNotFound(unknown))
        );
        assert_eq!(writes(&adapter), 0);
    }

    #[test]
    fn test_failed_discovery_never_resolves() {
        let (adapter, handle, sink, _events) = connected_adapter(true);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();

        let result = manager.subscribe(
            target(),
            &open(handle, DiscoveryPhase::Failed(GattStatus(133))),
            &ctx,
        );
        assert_eq!(result, Err(LinkError::ServiceNotFound(SERVICE)));
        assert_eq!(writes(&adapter), 0);
    }

    #[test]
    fn test_subscriptions_die_with_connection() {
        let (adapter, handle, sink, _events) = connected_adapter(true);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = SubscriptionManager::new();
        manager
            .subscribe(target(), &open(handle, DiscoveryPhase::Ready), &ctx)
            .unwrap();
        let characteristic = CharacteristicRef {
            connection: handle,
            service: SERVICE,
            uuid: CHARACTERISTIC,
        };

        manager.sync_with(Some(handle));
        assert!(manager.is_subscribed(&characteristic));

        manager.sync_with(None);
        assert!(!manager.is_subscribed(&characteristic));
    }
}
