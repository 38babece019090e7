//! Outbound event delivery.

use crate::domain::models::LinkEvent;
use tokio::sync::mpsc;

/// Receives every state change and error the link reports.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LinkEvent);
}

impl EventSink for mpsc::UnboundedSender<LinkEvent> {
    fn emit(&self, event: LinkEvent) {
        // A dropped receiver means nobody is listening any more
        let _ = self.send(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: LinkEvent) {
        (**self).emit(event)
    }
}
