//! Transport layer
//!
//! [`TransportChannel`] keeps a realtime socket to the backend when one can
//! be established and otherwise performs discrete one-shot requests. Callers
//! only see [`FrameTransport::submit`].

mod discrete;
mod realtime;

pub use discrete::DiscreteTransport;
pub use realtime::RealtimeTransport;

use crate::error::CaptureError;
use crate::events::{EventBus, SessionEvent};
use crate::frame::SubmissionRequest;
use async_trait::async_trait;
use minori_core::{BackendConfig, DetectionResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of the realtime channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    ClosedWithError(String),
}

/// Path a submission takes to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Realtime,
    Discrete,
}

/// A way of getting one frame classified
#[async_trait]
pub trait FrameTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Submit one request. `Ok` carries any well-formed backend reply,
    /// including inference failures; `Err` means the exchange itself failed.
    async fn submit(&self, request: SubmissionRequest) -> Result<DetectionResult, CaptureError>;
}

/// Realtime channel with transparent fallback to discrete requests
pub struct TransportChannel {
    config: BackendConfig,
    fallback: Arc<dyn FrameTransport>,
    realtime: Mutex<Option<Arc<RealtimeTransport>>>,
    state: Arc<RwLock<ChannelState>>,
    events: EventBus,
    lifecycle: tokio::sync::Mutex<()>,
}

impl TransportChannel {
    /// Channel whose fallback is an HTTP discrete transport to the same backend
    pub fn new(config: BackendConfig, events: EventBus) -> Result<Self, CaptureError> {
        let fallback = Arc::new(DiscreteTransport::new(&config)?);
        Ok(Self::with_fallback(config, fallback, events))
    }

    pub fn with_fallback(
        config: BackendConfig,
        fallback: Arc<dyn FrameTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            fallback,
            realtime: Mutex::new(None),
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            events,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state.read().clone()
    }

    pub fn is_open(&self) -> bool {
        *self.state.read() == ChannelState::Open
    }

    /// Establish the realtime channel for a session. Any previous channel is
    /// torn down first. Failure leaves the channel closed with an error and
    /// is not retried; submissions keep working over discrete requests.
    pub async fn connect(&self, session_id: &str) -> Result<(), CaptureError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;

        let url = self.config.realtime_url(session_id)?;
        *self.state.write() = ChannelState::Connecting;
        info!("Connecting realtime channel: {}", url);

        let result = RealtimeTransport::connect(
            &url,
            self.config.connect_timeout(),
            self.config.response_timeout(),
            self.state.clone(),
            self.events.clone(),
        )
        .await;

        match result {
            Ok(realtime) => {
                *self.realtime.lock() = Some(Arc::new(realtime));
                info!("Realtime channel open for session {}", session_id);
                Ok(())
            }
            Err(e) => {
                *self.state.write() = ChannelState::ClosedWithError(e.to_string());
                warn!("Realtime channel unavailable: {}", e);
                self.events.publish(SessionEvent::ConnectivityNotice(format!(
                    "Realtime connection unavailable ({}); using discrete requests",
                    e
                )));
                Err(e)
            }
        }
    }

    /// Close the realtime channel. Safe to call when nothing is connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
        *self.state.write() = ChannelState::Disconnected;
    }

    async fn teardown(&self) {
        let realtime = self.realtime.lock().take();
        if let Some(realtime) = realtime {
            realtime.close().await;
            info!("Realtime channel closed");
        }
    }

    fn open_realtime(&self) -> Option<Arc<RealtimeTransport>> {
        self.realtime
            .lock()
            .as_ref()
            .filter(|realtime| realtime.is_open())
            .cloned()
    }
}

#[async_trait]
impl FrameTransport for TransportChannel {
    fn kind(&self) -> TransportKind {
        if self.open_realtime().is_some() {
            TransportKind::Realtime
        } else {
            TransportKind::Discrete
        }
    }

    async fn submit(&self, request: SubmissionRequest) -> Result<DetectionResult, CaptureError> {
        match self.open_realtime() {
            Some(realtime) => {
                debug!("Submitting {} frame over realtime channel", request.crop);
                realtime.submit(request).await
            }
            None => {
                debug!("Submitting {} frame as discrete request", request.crop);
                self.fallback.submit(request).await
            }
        }
    }
}
