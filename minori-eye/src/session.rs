//! Capture session state machine
//!
//! ```text
//! CameraOff --start_camera--> CameraOnIdle
//! CameraOnIdle --start_realtime--> CameraOnRealtimeActive --stop_realtime--> CameraOnIdle
//! CameraOnIdle --single_capture--> CameraOnSingleCaptureInFlight --settled--> CameraOnIdle
//! any CameraOn* --stop_camera--> CameraOff
//! any CameraOn* --crop changed--> CameraOnIdle
//! ```

use crate::camera::{CameraBackend, FrameSource};
use crate::error::CaptureError;
use crate::events::{EventBus, SessionEvent};
use crate::frame::Frame;
use crate::scheduler::{CaptureScheduler, DeliveryGate, SubmissionHandle};
use crate::sink::{ResultSink, SinkSnapshot};
use crate::transport::{ChannelState, DiscreteTransport, FrameTransport, TransportChannel};
use bytes::Bytes;
use minori_core::{Crop, MinoriConfig};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    CameraOff,
    CameraOnIdle,
    CameraOnRealtimeActive,
    CameraOnSingleCaptureInFlight,
}

impl SessionState {
    pub fn is_camera_on(&self) -> bool {
        !matches!(self, SessionState::CameraOff)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::CameraOff => "camera off",
            SessionState::CameraOnIdle => "idle",
            SessionState::CameraOnRealtimeActive => "realtime active",
            SessionState::CameraOnSingleCaptureInFlight => "single capture in flight",
        };
        f.write_str(name)
    }
}

struct SessionInner {
    config: MinoriConfig,
    frames: Arc<FrameSource>,
    transport: Arc<TransportChannel>,
    scheduler: Arc<CaptureScheduler>,
    sink: Arc<ResultSink>,
    gate: Arc<DeliveryGate>,
    events: EventBus,
    state: Mutex<SessionState>,
    crop: RwLock<Option<Crop>>,
    session_id: Mutex<Option<String>>,
    /// Serialises camera start/stop
    lifecycle: tokio::sync::Mutex<()>,
    /// Identifies the current single capture
    flight: AtomicU64,
}

impl SessionInner {
    fn transition(&self, state: &mut SessionState, to: SessionState) {
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        info!("Session state: {} -> {}", from, to);
        self.events.publish(SessionEvent::StateChanged { from, to });
    }

    fn reject<T>(&self, err: CaptureError) -> Result<T, CaptureError> {
        warn!("{}", err);
        self.events.publish(SessionEvent::error(&err));
        Err(err)
    }
}

/// Drives one capture session: the camera, the crop selection, the trigger
/// modes and the transport to the backend.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl SessionController {
    /// Session against the configured backend over HTTP and, when enabled,
    /// the realtime channel.
    pub fn new(config: MinoriConfig, camera: Arc<dyn CameraBackend>) -> Result<Self, CaptureError> {
        config.validate()?;
        let fallback = Arc::new(DiscreteTransport::new(&config.backend)?);
        Ok(Self::assemble(config, camera, fallback))
    }

    /// Session whose discrete transport is supplied by the caller
    pub fn with_fallback(
        config: MinoriConfig,
        camera: Arc<dyn CameraBackend>,
        fallback: Arc<dyn FrameTransport>,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        Ok(Self::assemble(config, camera, fallback))
    }

    fn assemble(
        config: MinoriConfig,
        camera: Arc<dyn CameraBackend>,
        fallback: Arc<dyn FrameTransport>,
    ) -> Self {
        let events = EventBus::new(config.capture.event_buffer);
        let frames = Arc::new(FrameSource::new(camera, config.camera.clone()));
        let transport = Arc::new(TransportChannel::with_fallback(
            config.backend.clone(),
            fallback,
            events.clone(),
        ));
        let sink = Arc::new(ResultSink::new(events.clone()));
        let gate = Arc::new(DeliveryGate::new());
        let scheduler = Arc::new(CaptureScheduler::new(
            frames.clone(),
            transport.clone(),
            sink.clone(),
            gate.clone(),
            events.clone(),
            config.capture.interval(),
        ));

        Self {
            inner: Arc::new(SessionInner {
                config,
                frames,
                transport,
                scheduler,
                sink,
                gate,
                events,
                state: Mutex::new(SessionState::CameraOff),
                crop: RwLock::new(None),
                session_id: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                flight: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire the camera and try to open the realtime channel. The channel
    /// is best effort; without it submissions use discrete requests.
    pub async fn start_camera(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if self.state().is_camera_on() {
            debug!("Camera already on");
            return Ok(());
        }

        if let Err(e) = inner.frames.open().await {
            error!("Failed to start camera: {}", e);
            inner.sink.on_error(&e);
            return Err(e);
        }

        inner.gate.advance();
        let session_id = Uuid::new_v4().to_string();
        *inner.session_id.lock() = Some(session_id.clone());

        if inner.config.backend.realtime_enabled {
            if let Err(e) = inner.transport.connect(&session_id).await {
                warn!("Continuing with discrete requests: {}", e);
            }
        } else {
            info!("Realtime channel disabled, using discrete requests");
        }

        let mut state = inner.state.lock();
        inner.transition(&mut state, SessionState::CameraOnIdle);
        Ok(())
    }

    /// Stop everything and release the camera. Calling this while the
    /// camera is already off does nothing.
    pub async fn stop_camera(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        {
            let mut state = inner.state.lock();
            inner.scheduler.stop_periodic();
            inner.gate.advance();
            inner.frames.close();
            inner.transition(&mut state, SessionState::CameraOff);
        }

        inner.transport.disconnect().await;
        *inner.session_id.lock() = None;
    }

    /// Begin periodic capture for the selected crop
    pub fn start_realtime(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        match *state {
            SessionState::CameraOnIdle => {}
            SessionState::CameraOff => {
                return inner.reject(CaptureError::precondition(
                    "Please select a crop and ensure camera is active",
                ))
            }
            SessionState::CameraOnRealtimeActive => {
                return inner.reject(CaptureError::precondition("Realtime detection is already active"))
            }
            SessionState::CameraOnSingleCaptureInFlight => {
                return inner.reject(CaptureError::precondition("A single capture is still in progress"))
            }
        }

        let crop = *inner.crop.read();
        if let Err(e) = inner.scheduler.start_periodic(crop) {
            return inner.reject(e);
        }
        inner.transition(&mut state, SessionState::CameraOnRealtimeActive);
        Ok(())
    }

    /// Stop periodic capture. No-op unless it is running.
    pub fn stop_realtime(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if *state != SessionState::CameraOnRealtimeActive {
            return;
        }
        inner.scheduler.stop_periodic();
        inner.transition(&mut state, SessionState::CameraOnIdle);
    }

    /// Change the crop selection. A different selection stops periodic
    /// capture, clears the displayed result and discards outstanding results
    /// for the previous crop.
    pub fn select_crop(&self, selection: Option<Crop>) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        {
            let mut crop = inner.crop.write();
            if *crop == selection {
                return;
            }
            *crop = selection;
        }

        inner.scheduler.stop_periodic();
        inner.gate.advance();
        inner.sink.clear_result();
        if state.is_camera_on() {
            inner.transition(&mut state, SessionState::CameraOnIdle);
        }

        match selection {
            Some(crop) => info!("Crop selected: {}", crop),
            None => info!("Crop selection cleared"),
        }
    }

    /// Capture and submit one frame
    pub fn single_capture(&self) -> Result<SubmissionHandle, CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        match *state {
            SessionState::CameraOnIdle => {}
            SessionState::CameraOff => {
                return inner.reject(CaptureError::precondition(
                    "Please select a crop and ensure camera is active",
                ))
            }
            SessionState::CameraOnRealtimeActive => {
                return inner.reject(CaptureError::precondition(
                    "Single capture is unavailable while realtime detection is active",
                ))
            }
            SessionState::CameraOnSingleCaptureInFlight => {
                return inner.reject(CaptureError::precondition("A single capture is already in progress"))
            }
        }

        let crop = *inner.crop.read();
        let flight = inner.flight.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::downgrade(&self.inner);
        let on_settled = Box::new(move || {
            let Some(inner) = session.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if *state == SessionState::CameraOnSingleCaptureInFlight
                && inner.flight.load(Ordering::SeqCst) == flight
            {
                inner.transition(&mut state, SessionState::CameraOnIdle);
            }
        });

        match inner.scheduler.trigger_once(crop, Some(on_settled)) {
            Ok(handle) => {
                inner.transition(&mut state, SessionState::CameraOnSingleCaptureInFlight);
                Ok(handle)
            }
            Err(e @ CaptureError::DeviceUnavailable(_)) => {
                inner.sink.on_error(&e);
                Err(e)
            }
            Err(e) => inner.reject(e),
        }
    }

    /// Read an image file and submit it
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<SubmissionHandle, CaptureError> {
        let path = path.as_ref();
        self.check_upload()?;

        let max_bytes = self.inner.config.capture.max_upload_bytes;
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > max_bytes as u64 {
            return self.inner.reject(CaptureError::InvalidImage(format!(
                "{} is too large ({} bytes, max {} bytes)",
                path.display(),
                metadata.len(),
                max_bytes
            )));
        }

        let data = tokio::fs::read(path).await?;
        debug!("Read {} bytes from {}", data.len(), path.display());
        self.upload_bytes(data)
    }

    /// Submit an in-memory image
    pub fn upload_bytes(&self, data: impl Into<Bytes>) -> Result<SubmissionHandle, CaptureError> {
        let inner = &self.inner;
        self.check_upload()?;

        let frame = match Frame::from_upload(data, inner.config.capture.max_upload_bytes) {
            Ok(frame) => frame,
            Err(e) => return inner.reject(e),
        };

        let _state = inner.state.lock();
        let crop = *inner.crop.read();
        inner
            .scheduler
            .upload(crop, frame, None)
            .or_else(|e| inner.reject(e))
    }

    fn check_upload(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        if inner.crop.read().is_none() {
            return inner.reject(CaptureError::precondition("Please select a crop first"));
        }
        if self.state() == SessionState::CameraOnRealtimeActive {
            return inner.reject(CaptureError::precondition(
                "Upload is unavailable while realtime detection is active",
            ));
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn crop(&self) -> Option<Crop> {
        *self.inner.crop.read()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.transport.state()
    }

    /// Successful periodic results since realtime detection last started
    pub fn frames_processed(&self) -> u64 {
        self.inner.scheduler.frames_processed()
    }

    /// A submission of any kind is outstanding
    pub fn is_processing(&self) -> bool {
        self.inner.scheduler.is_in_flight()
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        self.inner.sink.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &MinoriConfig {
        &self.inner.config
    }
}
