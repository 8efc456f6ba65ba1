//! Latest inference outcome as shown to the user

use crate::error::{CaptureError, ErrorKind};
use crate::events::{EventBus, SessionEvent};
use minori_core::Detection;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Which of result/error arrived last
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latest {
    Result,
    Error,
}

/// Error as displayed to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time copy of the sink
#[derive(Debug, Clone, Default)]
pub struct SinkSnapshot {
    pub result: Option<Detection>,
    pub error: Option<ReportedError>,
    pub latest: Option<Latest>,
}

/// Holds the displayed result and error. A result replaces the previous
/// result and clears the error; an error is overlaid and leaves the last
/// result in place.
pub struct ResultSink {
    state: RwLock<SinkSnapshot>,
    events: EventBus,
}

impl ResultSink {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(SinkSnapshot::default()),
            events,
        }
    }

    pub fn on_result(&self, detection: Detection) {
        {
            let mut state = self.state.write();
            state.result = Some(detection.clone());
            state.error = None;
            state.latest = Some(Latest::Result);
        }
        info!(
            crop = %detection.crop,
            disease = %detection.detected_disease,
            "Detection result received"
        );
        self.events.publish(SessionEvent::ResultUpdated(detection));
    }

    pub fn on_error(&self, error: &CaptureError) {
        {
            let mut state = self.state.write();
            state.error = Some(ReportedError {
                kind: error.kind(),
                message: error.to_string(),
            });
            state.latest = Some(Latest::Error);
        }
        warn!("Submission error: {}", error);
        self.events.publish(SessionEvent::error(error));
    }

    /// Drop the displayed result (crop selection changed)
    pub fn clear_result(&self) {
        let cleared = {
            let mut state = self.state.write();
            let had_result = state.result.take().is_some();
            if state.latest == Some(Latest::Result) {
                state.latest = if state.error.is_some() { Some(Latest::Error) } else { None };
            }
            had_result
        };
        if cleared {
            debug!("Displayed result cleared");
            self.events.publish(SessionEvent::ResultCleared);
        }
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        self.state.read().clone()
    }

    pub fn result(&self) -> Option<Detection> {
        self.state.read().result.clone()
    }

    pub fn error(&self) -> Option<ReportedError> {
        self.state.read().error.clone()
    }

    pub fn latest(&self) -> Option<Latest> {
        self.state.read().latest
    }
}
