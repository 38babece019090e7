//! Bluetooth Service Module
//!
//! Single owner of the link state. Caller commands, platform callbacks and
//! scan timers are funnelled into one loop, so no two of them ever race on
//! the same connection.

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::{
    DeviceIdentity, ScanFilter, SubscriptionTarget, TextDecoding,
};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::{
    adapter::{AdapterEvent, AdapterEventReceiver, BleAdapter, CharacteristicRef},
    connection::{ConnectionManager, ConnectionState},
    context::LinkContext,
    permissions::PermissionGate,
    protocol::NotificationDecoder,
    scanner::{ScanController, ScanExpired, ScanToggle},
    sink::EventSink,
    subscription::SubscriptionManager,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Requests accepted by the link loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartScan {
        filter: ScanFilter,
        duration: Duration,
    },
    StopScan,
    Connect(DeviceIdentity),
    ConnectAddress(String),
    Subscribe(SubscriptionTarget),
    Disconnect,
    Shutdown,
}

/// Behaviour switches of the link loop
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub stop_scan_on_match: bool,
    /// Subscribe to this pair as soon as services are discovered
    pub auto_subscribe: Option<SubscriptionTarget>,
    pub text_decoding: TextDecoding,
}

impl From<&LinkSettings> for LinkOptions {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            stop_scan_on_match: settings.stop_scan_on_match,
            auto_subscribe: settings
                .auto_subscribe
                .then(|| settings.subscription_target())
                .flatten(),
            text_decoding: settings.text_decoding,
        }
    }
}

/// Fire-and-forget front of the link loop.
///
/// Every method returns immediately; outcomes are reported as events. The
/// return value only says whether the loop was still there to take the
/// request.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn start_scan(&self, filter: ScanFilter, duration: Duration) -> bool {
        self.send(LinkCommand::StartScan { filter, duration })
    }

    pub fn stop_scan(&self) -> bool {
        self.send(LinkCommand::StopScan)
    }

    pub fn connect(&self, device: DeviceIdentity) -> bool {
        self.send(LinkCommand::Connect(device))
    }

    pub fn connect_address(&self, address: impl Into<String>) -> bool {
        self.send(LinkCommand::ConnectAddress(address.into()))
    }

    pub fn subscribe(&self, target: SubscriptionTarget) -> bool {
        self.send(LinkCommand::Subscribe(target))
    }

    pub fn disconnect(&self) -> bool {
        self.send(LinkCommand::Disconnect)
    }

    pub fn shutdown(&self) -> bool {
        self.send(LinkCommand::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// All mutable link state, driven one step at a time
pub struct LinkCore {
    options: LinkOptions,
    scanner: ScanController,
    connection: ConnectionManager,
    subscriptions: SubscriptionManager,
    decoder: NotificationDecoder,
}

impl LinkCore {
    pub fn new(options: LinkOptions, expiry_sender: mpsc::UnboundedSender<ScanExpired>) -> Self {
        Self {
            decoder: NotificationDecoder::new(options.text_decoding),
            scanner: ScanController::new(expiry_sender),
            connection: ConnectionManager::new(),
            subscriptions: SubscriptionManager::new(),
            options,
        }
    }

    pub fn connection_state(&self) -> &ConnectionState {
        self.connection.state()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn handle_command(&mut self, command: LinkCommand, ctx: &LinkContext<'_>) {
        debug!("Command: {:?}", command);
        let result = match command {
            LinkCommand::StartScan { filter, duration } => self
                .scanner
                .start_scan(filter, duration, ctx)
                .map(|toggle| {
                    if toggle == ScanToggle::Stopped {
                        info!("Scan was running, start request stopped it");
                    }
                }),
            LinkCommand::StopScan => {
                self.scanner.stop_scan(ctx);
                Ok(())
            }
            LinkCommand::Connect(device) => self.connect(device, ctx),
            LinkCommand::ConnectAddress(address) => ctx
                .adapter
                .remote_device(&address)
                .ok_or(LinkError::DeviceNotFound(address))
                .and_then(|device| self.connect(device, ctx)),
            LinkCommand::Subscribe(target) => {
                self.subscriptions
                    .subscribe(target, self.connection.state(), ctx)
            }
            LinkCommand::Disconnect => {
                self.connection.disconnect(ctx);
                self.subscriptions.sync_with(self.connection.live_handle());
                Ok(())
            }
            LinkCommand::Shutdown => {
                self.shutdown(ctx);
                Ok(())
            }
        };

        if let Err(e) = result {
            ctx.report(e);
        }
    }

    pub fn handle_adapter_event(&mut self, event: AdapterEvent, ctx: &LinkContext<'_>) {
        trace!(connection = ?event.connection(), "Adapter event: {:?}", event);
        let result = match event {
            AdapterEvent::DeviceFound(device) => match self.scanner.on_device_found(device, ctx) {
                Some(matched) => {
                    if self.options.stop_scan_on_match {
                        self.scanner.stop_scan(ctx);
                    }
                    self.connect(matched, ctx)
                }
                None => Ok(()),
            },
            AdapterEvent::ScanFailed { code } => Err(self.scanner.on_scan_failed(code)),
            AdapterEvent::ConnectionStateChanged {
                handle,
                connected,
                status,
            } => {
                let result = self
                    .connection
                    .on_connection_state_changed(handle, connected, status, ctx);
                self.subscriptions.sync_with(self.connection.live_handle());
                result
            }
            AdapterEvent::ServicesDiscovered { handle, status } => {
                match self.connection.on_services_discovered(handle, status, ctx) {
                    Ok(true) => match self.options.auto_subscribe {
                        Some(target) => {
                            self.subscriptions
                                .subscribe(target, self.connection.state(), ctx)
                        }
                        None => Ok(()),
                    },
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            AdapterEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_changed(&characteristic, &value, ctx),
        };

        if let Err(e) = result {
            ctx.report(e);
        }
    }

    pub fn handle_scan_expired(&mut self, expired: ScanExpired, ctx: &LinkContext<'_>) {
        self.scanner.on_expired(expired, ctx);
    }

    /// Stop scanning and close the connection, if any
    pub fn shutdown(&mut self, ctx: &LinkContext<'_>) {
        self.scanner.stop_scan(ctx);
        self.connection.disconnect(ctx);
        self.subscriptions.invalidate();
    }

    fn connect(&mut self, device: DeviceIdentity, ctx: &LinkContext<'_>) -> LinkResult<()> {
        let result = self.connection.connect(device, ctx);
        self.subscriptions.sync_with(self.connection.live_handle());
        result
    }

    fn on_characteristic_changed(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        ctx: &LinkContext<'_>,
    ) -> LinkResult<()> {
        if !self.subscriptions.is_subscribed(characteristic)
            || self.connection.live_handle() != Some(characteristic.connection)
        {
            trace!(characteristic = %characteristic.uuid, "Dropping update of unsubscribed characteristic");
            return Ok(());
        }

        ctx.require_permissions()?;

        match self.decoder.decode(value) {
            Some(notification) => {
                debug!(pressed = notification.pressed, "Button notification");
                for event in notification.into_events() {
                    ctx.emit(event);
                }
            }
            None => trace!("Dropping empty notification"),
        }
        Ok(())
    }
}

/// Main Bluetooth service: the loop around [`LinkCore`]
pub struct BluetoothService<A, S> {
    adapter: A,
    gate: Box<dyn PermissionGate>,
    sink: S,
    core: LinkCore,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    adapter_events: AdapterEventReceiver,
    scan_expiries: mpsc::UnboundedReceiver<ScanExpired>,
}

impl<A: BleAdapter, S: EventSink> BluetoothService<A, S> {
    /// Create the service and the handle that drives it.
    ///
    /// `adapter_events` must be the receiving end of the channel `adapter`
    /// delivers its callbacks on.
    pub fn new(
        adapter: A,
        adapter_events: AdapterEventReceiver,
        gate: Box<dyn PermissionGate>,
        sink: S,
        options: LinkOptions,
    ) -> (Self, LinkHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (expiry_tx, scan_expiries) = mpsc::unbounded_channel();

        let service = Self {
            adapter,
            gate,
            sink,
            core: LinkCore::new(options, expiry_tx),
            commands,
            adapter_events,
            scan_expiries,
        };
        (
            service,
            LinkHandle {
                commands: command_tx,
            },
        )
    }

    /// Run until [`LinkCommand::Shutdown`] or until every handle is dropped.
    /// The connection is closed on the way out.
    pub async fn run(mut self) {
        info!("Link loop started");

        loop {
            let ctx = LinkContext {
                adapter: &self.adapter,
                gate: self.gate.as_ref(),
                sink: &self.sink,
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Shutdown) | None => break,
                    Some(command) => self.core.handle_command(command, &ctx),
                },
                Some(event) = self.adapter_events.recv() => {
                    self.core.handle_adapter_event(event, &ctx);
                }
                Some(expired) = self.scan_expiries.recv() => {
                    self.core.handle_scan_expired(expired, &ctx);
                }
            }
        }

        let ctx = LinkContext {
            adapter: &self.adapter,
            gate: self.gate.as_ref(),
            sink: &self.sink,
        };
        self.core.shutdown(&ctx);
        info!("Link loop stopped");
    }
}
