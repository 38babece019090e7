//! BLE Connection Module
//!
//! GATT connection state machine:
//!
//! ```text
//! Idle ──connect──▶ Connecting ──Connected──▶ Open(Discovering) ──ok──▶ Open(Ready)
//!                        │                          │
//!                        │                          └──failure──▶ Open(Failed)
//!                        ▼
//!   Closed ◀── disconnect() / Disconnected / superseded by connect
//! ```

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::{DeviceIdentity, LinkEvent};
use crate::infrastructure::bluetooth::adapter::{ConnectionHandle, GattStatus};
use crate::infrastructure::bluetooth::context::LinkContext;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Discovering,
    Ready,
    /// Discovery completed with an error; the session stays open but no
    /// characteristic can be resolved on it
    Failed(GattStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting {
        handle: ConnectionHandle,
        device: DeviceIdentity,
    },
    Open {
        handle: ConnectionHandle,
        device: DeviceIdentity,
        phase: DiscoveryPhase,
    },
    Closed,
}

impl ConnectionState {
    /// Handle of the live session, if there is one
    pub fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Self::Connecting { handle, .. } | Self::Open { handle, .. } => Some(*handle),
            Self::Idle | Self::Closed => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Owns the single live GATT session
pub struct ConnectionManager {
    state: ConnectionState,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn live_handle(&self) -> Option<ConnectionHandle> {
        self.state.handle()
    }

    /// Request a session with `device`, closing any live one first.
    ///
    /// Nothing is reported on success; the outcome arrives through
    /// [`Self::on_connection_state_changed`].
    pub fn connect(&mut self, device: DeviceIdentity, ctx: &LinkContext<'_>) -> LinkResult<()> {
        ctx.require_permissions()?;

        if let Some(previous) = self.state.handle() {
            info!(handle = %previous, "Closing existing connection before reconnecting");
            let was_open = self.state.is_open();
            self.release(previous, ctx);
            if was_open {
                ctx.emit(LinkEvent::ConnectionStateChanged(false));
            }
        }

        let handle = ctx.adapter.connect(&device)?;
        info!(handle = %handle, address = %device.address, "Connecting to {}", device.display_name());
        self.state = ConnectionState::Connecting { handle, device };
        Ok(())
    }

    /// Close the live session. Returns false (and reports nothing) if there
    /// was none.
    pub fn disconnect(&mut self, ctx: &LinkContext<'_>) -> bool {
        let Some(handle) = self.state.handle() else {
            debug!("Disconnect requested without a connection");
            return false;
        };

        info!(handle = %handle, "Disconnecting");
        self.release(handle, ctx);
        ctx.emit(LinkEvent::ConnectionStateChanged(false));
        true
    }

    pub fn on_connection_state_changed(
        &mut self,
        handle: ConnectionHandle,
        connected: bool,
        status: GattStatus,
        ctx: &LinkContext<'_>,
    ) -> LinkResult<()> {
        if self.state.handle() != Some(handle) {
            debug!(handle = %handle, connected, "Ignoring state change of a finished connection");
            return Ok(());
        }

        if !connected {
            info!(handle = %handle, status = %status, "Disconnected from GATT server");
            ctx.adapter.close(handle);
            self.state = ConnectionState::Closed;
            ctx.emit(LinkEvent::ConnectionStateChanged(false));
            return Ok(());
        }

        let device = match &self.state {
            ConnectionState::Connecting { device, .. } => device.clone(),
            _ => {
                debug!(handle = %handle, "Duplicate connected notification");
                return Ok(());
            }
        };

        // Discovery is radio traffic, so it waits for the grant like any request
        ctx.require_permissions()?;

        info!(handle = %handle, "Connected to GATT server");
        self.state = ConnectionState::Open {
            handle,
            device,
            phase: DiscoveryPhase::Discovering,
        };
        ctx.emit(LinkEvent::ConnectionStateChanged(true));

        if let Err(e) = ctx.adapter.discover_services(handle) {
            warn!(handle = %handle, "Service discovery could not be started: {}", e);
            return self.fail_discovery(GattStatus::FAILURE);
        }
        Ok(())
    }

    /// Returns true when the session just became ready for subscriptions
    pub fn on_services_discovered(
        &mut self,
        handle: ConnectionHandle,
        status: GattStatus,
        ctx: &LinkContext<'_>,
    ) -> LinkResult<bool> {
        if self.state.handle() != Some(handle) {
            debug!(handle = %handle, "Ignoring discovery result of a finished connection");
            return Ok(false);
        }

        let ConnectionState::Open { phase, .. } = &mut self.state else {
            debug!(handle = %handle, "Discovery result before connection was established");
            return Ok(false);
        };
        if *phase != DiscoveryPhase::Discovering {
            debug!(handle = %handle, "Duplicate discovery result");
            return Ok(false);
        }

        if !status.is_success() {
            return self.fail_discovery(status).map(|_| false);
        }

        *phase = DiscoveryPhase::Ready;
        info!(handle = %handle, "Services discovered");
        ctx.emit(LinkEvent::ServicesDiscovered(
            "Services discovered successfully.".to_string(),
        ));
        Ok(true)
    }

    fn fail_discovery(&mut self, status: GattStatus) -> LinkResult<()> {
        if let ConnectionState::Open { phase, .. } = &mut self.state {
            *phase = DiscoveryPhase::Failed(status);
        }
        Err(LinkError::ServiceDiscoveryFailed { status })
    }

    fn release(&mut self, handle: ConnectionHandle, ctx: &LinkContext<'_>) {
        ctx.adapter.disconnect(handle);
        ctx.adapter.close(handle);
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{AdapterRequest, FakeAdapter};
    use crate::infrastructure::bluetooth::permissions::{
        AlwaysGranted, BlePermission, RuntimePermissionGate,
    };
    use tokio::sync::mpsc;

    fn setup() -> (
        FakeAdapter,
        mpsc::UnboundedSender<LinkEvent>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (adapter_tx, _) = mpsc::unbounded_channel();
        let (sink, events) = mpsc::unbounded_channel();
        (FakeAdapter::new(adapter_tx), sink, events)
    }

    fn device(address: &str) -> DeviceIdentity {
        DeviceIdentity::new(address, Some("Button".to_string()))
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_connect_is_silent_until_callback() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();

        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();

        assert!(matches!(manager.state(), ConnectionState::Connecting { .. }));
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_connected_triggers_discovery() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let handle = manager.live_handle().unwrap();

        manager
            .on_connection_state_changed(handle, true, GattStatus::SUCCESS, &ctx)
            .unwrap();

        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::ConnectionStateChanged(true)]
        );
        assert!(adapter
            .requests()
            .contains(&AdapterRequest::DiscoverServices(handle)));

        assert!(manager
            .on_services_discovered(handle, GattStatus::SUCCESS, &ctx)
            .unwrap());
        assert!(matches!(
            manager.state(),
            ConnectionState::Open {
                phase: DiscoveryPhase::Ready,
                ..
            }
        ));
        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::ServicesDiscovered(
                "Services discovered successfully.".to_string()
            )]
        );
    }

    #[test]
    fn test_reconnect_closes_previous_first() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let first = manager.live_handle().unwrap();
        manager
            .on_connection_state_changed(first, true, GattStatus::SUCCESS, &ctx)
            .unwrap();
        drain(&mut events);

        manager.connect(device("BB:BB:BB:BB:BB:BB"), &ctx).unwrap();
        let second = manager.live_handle().unwrap();

        assert_ne!(first, second);
        assert_eq!(adapter.open_sessions(), vec![second]);
        let requests = adapter.requests();
        let closed_at = requests
            .iter()
            .position(|r| *r == AdapterRequest::Close(first))
            .unwrap();
        let connected_at = requests
            .iter()
            .position(|r| matches!(r, AdapterRequest::Connect(_, h) if *h == second))
            .unwrap();
        assert!(closed_at < connected_at);
        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::ConnectionStateChanged(false)]
        );
    }

    #[test]
    fn test_late_events_from_superseded_connection_are_dropped() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let first = manager.live_handle().unwrap();
        manager.connect(device("BB:BB:BB:BB:BB:BB"), &ctx).unwrap();

        manager
            .on_connection_state_changed(first, true, GattStatus::SUCCESS, &ctx)
            .unwrap();
        manager
            .on_connection_state_changed(first, false, GattStatus::SUCCESS, &ctx)
            .unwrap();

        assert!(matches!(manager.state(), ConnectionState::Connecting { .. }));
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_disconnect_twice_reports_once() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();

        assert!(manager.disconnect(&ctx));
        assert!(!manager.disconnect(&ctx));

        assert_eq!(manager.state(), &ConnectionState::Closed);
        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::ConnectionStateChanged(false)]
        );
        assert!(adapter.open_sessions().is_empty());
    }

    #[test]
    fn test_unsolicited_disconnect_is_terminal() {
        let (adapter, sink, mut events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let handle = manager.live_handle().unwrap();
        manager
            .on_connection_state_changed(handle, true, GattStatus::SUCCESS, &ctx)
            .unwrap();

        manager
            .on_connection_state_changed(handle, false, GattStatus(8), &ctx)
            .unwrap();
        // Nothing more for this session once it is lost
        assert!(!manager
            .on_services_discovered(handle, GattStatus::SUCCESS, &ctx)
            .unwrap());

        assert_eq!(manager.state(), &ConnectionState::Closed);
        assert_eq!(
            drain(&mut events),
            vec![
                LinkEvent::ConnectionStateChanged(true),
                LinkEvent::ConnectionStateChanged(false)
            ]
        );
        assert!(adapter.open_sessions().is_empty());
        assert!(!manager.disconnect(&ctx));
    }

    #[test]
    fn test_discovery_failure_keeps_session_open() {
        let (adapter, sink, _events) = setup();
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let handle = manager.live_handle().unwrap();
        manager
            .on_connection_state_changed(handle, true, GattStatus::SUCCESS, &ctx)
            .unwrap();

        let err = manager
            .on_services_discovered(handle, GattStatus(129), &ctx)
            .unwrap_err();

        assert_eq!(
            err,
            LinkError::ServiceDiscoveryFailed {
                status: GattStatus(129)
            }
        );
        assert!(matches!(
            manager.state(),
            ConnectionState::Open {
                phase: DiscoveryPhase::Failed(GattStatus(129)),
                ..
            }
        ));
        assert_eq!(adapter.open_sessions(), vec![handle]);
    }

    #[test]
    fn test_connect_without_permissions_touches_nothing() {
        let (adapter, sink, mut events) = setup();
        let gate = RuntimePermissionGate::new(31);
        gate.grant(BlePermission::Connect);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &gate,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();

        let err = manager
            .connect(device("AA:AA:AA:AA:AA:AA"), &ctx)
            .unwrap_err();

        assert_eq!(err, LinkError::PermissionDenied);
        assert_eq!(manager.state(), &ConnectionState::Idle);
        assert!(adapter.requests().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_revoked_permission_holds_back_discovery() {
        let (adapter, sink, mut events) = setup();
        let gate = RuntimePermissionGate::new(31);
        gate.grant(BlePermission::Connect);
        gate.grant(BlePermission::Scan);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &gate,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let handle = manager.live_handle().unwrap();

        gate.revoke(BlePermission::Scan);
        let err = manager
            .on_connection_state_changed(handle, true, GattStatus::SUCCESS, &ctx)
            .unwrap_err();

        assert_eq!(err, LinkError::PermissionDenied);
        assert!(matches!(manager.state(), ConnectionState::Connecting { .. }));
        assert!(!adapter
            .requests()
            .contains(&AdapterRequest::DiscoverServices(handle)));
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_disconnect_callback_ignores_permissions() {
        let (adapter, sink, mut events) = setup();
        let gate = RuntimePermissionGate::new(31);
        gate.grant(BlePermission::Connect);
        gate.grant(BlePermission::Scan);
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &gate,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();
        manager.connect(device("AA:AA:AA:AA:AA:AA"), &ctx).unwrap();
        let handle = manager.live_handle().unwrap();
        manager
            .on_connection_state_changed(handle, true, GattStatus::SUCCESS, &ctx)
            .unwrap();
        drain(&mut events);

        gate.revoke(BlePermission::Connect);
        manager
            .on_connection_state_changed(handle, false, GattStatus(8), &ctx)
            .unwrap();

        assert_eq!(manager.state(), &ConnectionState::Closed);
        assert!(adapter.open_sessions().is_empty());
        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::ConnectionStateChanged(false)]
        );
    }

    #[test]
    fn test_refused_connect_leaves_no_session() {
        let (adapter, sink, _events) = setup();
        adapter.fail_connect("radio off");
        let ctx = LinkContext {
            adapter: &adapter,
            gate: &AlwaysGranted,
            sink: &sink,
        };
        let mut manager = ConnectionManager::new();

        let err = manager
            .connect(device("AA:AA:AA:AA:AA:AA"), &ctx)
            .unwrap_err();
        assert_eq!(err, LinkError::Platform("radio off".to_string()));
        assert_eq!(manager.live_handle(), None);
    }
}
