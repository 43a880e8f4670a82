use crate::{EventError, EventResult, SecurityEvent};
use tokio::sync::mpsc;
use tracing::warn;

/// Cloneable producer handle over the downstream event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SecurityEvent>,
}

impl EventSink {
    /// Builds a sink together with the consumer half of the bus.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Best-effort emit: a full or closed bus drops the event with a warning.
    /// Event delivery must never stall or fail request processing.
    pub fn emit(&self, event: SecurityEvent) {
        if let Err(err) = self.try_emit(event) {
            warn!(%err, "dropping security event");
        }
    }

    pub fn try_emit(&self, event: SecurityEvent) -> EventResult<()> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Closed(_) => EventError::Closed,
            mpsc::error::TrySendError::Full(_) => EventError::Full,
        })
    }
}
