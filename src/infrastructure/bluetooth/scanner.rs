//! BLE Scanner Module
//!
//! Time-bounded device discovery with a first-match-wins filter.

use crate::domain::error::{LinkError, LinkResult};
use crate::domain::models::{DeviceIdentity, LinkEvent, ScanFilter};
use crate::infrastructure::bluetooth::context::LinkContext;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Timer notification that a scan session ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanExpired {
    pub session: u64,
}

/// What a call to [`ScanController::start_scan`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanToggle {
    Started,
    Stopped,
}

struct ScanSession {
    id: u64,
    filter: ScanFilter,
    timer: JoinHandle<()>,
    matched: Option<DeviceIdentity>,
}

/// Owns at most one scan session at a time.
///
/// Each session arms its own timer task; the task is aborted when the session
/// ends early and a late expiry for an older session is ignored.
pub struct ScanController {
    session: Option<ScanSession>,
    next_session: u64,
    expiry_sender: mpsc::UnboundedSender<ScanExpired>,
}

impl ScanController {
    pub fn new(expiry_sender: mpsc::UnboundedSender<ScanExpired>) -> Self {
        Self {
            session: None,
            next_session: 0,
            expiry_sender,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    /// Start a scan, or stop the running one.
    ///
    /// Must be called from within a tokio runtime; the session timer is a
    /// spawned task.
    pub fn start_scan(
        &mut self,
        filter: ScanFilter,
        duration: Duration,
        ctx: &LinkContext<'_>,
    ) -> LinkResult<ScanToggle> {
        if self.is_scanning() {
            self.stop_scan(ctx);
            return Ok(ScanToggle::Stopped);
        }

        ctx.require_permissions()?;
        ctx.adapter.start_scan(duration)?;

        self.next_session += 1;
        let id = self.next_session;
        let sender = self.expiry_sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = sender.send(ScanExpired { session: id });
        });

        info!(session = id, ?filter, "Scan started for {:?}", duration);
        self.session = Some(ScanSession {
            id,
            filter,
            timer,
            matched: None,
        });
        Ok(ScanToggle::Started)
    }

    /// Stop the running scan. Returns false if there was none.
    pub fn stop_scan(&mut self, ctx: &LinkContext<'_>) -> bool {
        match self.session.take() {
            Some(session) => {
                session.timer.abort();
                ctx.adapter.stop_scan();
                info!(session = session.id, "Scan stopped");
                true
            }
            None => false,
        }
    }

    pub fn on_expired(&mut self, expired: ScanExpired, ctx: &LinkContext<'_>) {
        let live = self.session.as_ref().map(|session| session.id);
        if live == Some(expired.session) {
            info!(session = expired.session, "Scan duration elapsed");
            self.stop_scan(ctx);
        } else {
            debug!(session = expired.session, "Ignoring expiry of a finished scan");
        }
    }

    /// Check a discovered device against the session filter.
    ///
    /// Returns the device for the first match of the session only.
    pub fn on_device_found(
        &mut self,
        device: DeviceIdentity,
        ctx: &LinkContext<'_>,
    ) -> Option<DeviceIdentity> {
        let session = self.session.as_mut()?;
        if session.matched.is_some() || !session.filter.matches(&device) {
            return None;
        }

        info!(session = session.id, address = %device.address, "Matched {}", device.display_name());
        session.matched = Some(device.clone());
        ctx.emit(LinkEvent::DeviceFound(device.display_name().to_string()));
        Some(device)
    }

    /// The platform aborted the scan on its own
    pub fn on_scan_failed(&mut self, code: i32) -> LinkError {
        if let Some(session) = self.session.take() {
            session.timer.abort();
            info!(session = session.id, code, "Scan aborted by platform");
        }
        LinkError::ScanFailed { code }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.timer.abort();
        }
    }
}
