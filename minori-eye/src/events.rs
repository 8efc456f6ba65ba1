//! Session event bus
//!
//! Observers subscribe to a broadcast channel instead of polling state.
//! Sending never blocks; a lagging receiver loses the oldest events.

use crate::error::{CaptureError, ErrorKind};
use crate::session::SessionState;
use minori_core::Detection;
use tokio::sync::broadcast;

/// Notification emitted by the session and its components
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    ResultUpdated(Detection),
    ResultCleared,
    ErrorRaised { kind: ErrorKind, message: String },
    /// Realtime channel problem; submissions continue over discrete requests
    ConnectivityNotice(String),
    /// A periodic submission completed successfully
    FrameProcessed { count: u64 },
    /// A periodic tick found a submission still outstanding
    TickSkipped,
}

impl SessionEvent {
    pub fn error(err: &CaptureError) -> Self {
        SessionEvent::ErrorRaised {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Cloneable handle used by components to publish events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
