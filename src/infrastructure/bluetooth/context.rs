use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::LinkEvent;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::permissions::PermissionGate;
use crate::infrastructure::bluetooth::sink::EventSink;
use tracing::{debug, warn};

/// Collaborators every manager needs for one step of the state machine
pub struct LinkContext<'a> {
    pub adapter: &'a dyn BleAdapter,
    pub gate: &'a dyn PermissionGate,
    pub sink: &'a dyn EventSink,
}

impl LinkContext<'_> {
    pub fn require_permissions(&self) -> LinkResult<()> {
        if self.gate.has_ble_permissions() {
            Ok(())
        } else {
            Err(LinkError::PermissionDenied)
        }
    }

    pub fn emit(&self, event: LinkEvent) {
        debug!(signal = event.signal_name(), "Emitting {:?}", event);
        self.sink.emit(event);
    }

    /// Report a failed operation once
    pub fn report(&self, error: LinkError) {
        warn!("{}", error);
        self.emit(error.into_event());
    }
}
