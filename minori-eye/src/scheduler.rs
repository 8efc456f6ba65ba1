//! Capture scheduling
//!
//! Three trigger modes share one submission slot: at most one submission is
//! outstanding at any time, whatever triggered it. Periodic ticks that find
//! the slot taken are skipped, never queued.

use crate::camera::FrameSource;
use crate::error::CaptureError;
use crate::events::{EventBus, SessionEvent};
use crate::frame::{Frame, SubmissionRequest};
use crate::sink::ResultSink;
use crate::transport::FrameTransport;
use minori_core::{Crop, DetectionResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Callback run once a submission has settled
pub type SettledCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Periodic,
    OneShot,
    Upload,
}

/// Admission ticket taken when a submission is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
}

/// Decides whether a completed submission may still reach the sink.
///
/// Advancing the epoch invalidates every outstanding ticket, so results of
/// submissions made before a camera stop or crop change are discarded.
#[derive(Debug, Default)]
pub struct DeliveryGate {
    epoch: AtomicU64,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            epoch: self.epoch.load(Ordering::SeqCst),
        }
    }

    pub fn admits(&self, ticket: Ticket) -> bool {
        self.epoch.load(Ordering::SeqCst) == ticket.epoch
    }

    /// Start a new epoch, returning its number
    pub fn advance(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Handle to a dispatched submission
#[derive(Debug)]
pub struct SubmissionHandle {
    mode: TriggerMode,
    task: JoinHandle<Result<DetectionResult, CaptureError>>,
}

impl SubmissionHandle {
    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    /// Wait for the outcome. The sink has already been updated by the time
    /// this returns.
    pub async fn wait(self) -> Result<DetectionResult, CaptureError> {
        self.task
            .await
            .map_err(|e| CaptureError::SubmissionFailure(format!("submission task failed: {}", e)))?
    }
}

struct PeriodicRun {
    generation: u64,
    crop: Crop,
    task: JoinHandle<()>,
}

/// Clears the in-flight flag however the submission task ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CaptureScheduler {
    frames: Arc<FrameSource>,
    transport: Arc<dyn FrameTransport>,
    sink: Arc<ResultSink>,
    gate: Arc<DeliveryGate>,
    events: EventBus,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    periodic: Mutex<Option<PeriodicRun>>,
    generation: AtomicU64,
}

impl CaptureScheduler {
    pub fn new(
        frames: Arc<FrameSource>,
        transport: Arc<dyn FrameTransport>,
        sink: Arc<ResultSink>,
        gate: Arc<DeliveryGate>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            frames,
            transport,
            sink,
            gate,
            events,
            interval,
            in_flight: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicU64::new(0)),
            periodic: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Start submitting a frame every interval. The first tick fires one
    /// full interval after this call.
    pub fn start_periodic(self: &Arc<Self>, selection: Option<Crop>) -> Result<(), CaptureError> {
        let crop = selection
            .ok_or_else(|| CaptureError::precondition("Please select a crop and ensure camera is active"))?;
        if !self.frames.is_open() {
            return Err(CaptureError::precondition(
                "Please select a crop and ensure camera is active",
            ));
        }

        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return Err(CaptureError::precondition("Realtime detection is already active"));
        }

        self.processed.store(0, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.interval;
        let first_tick = Instant::now() + interval;
        let scheduler = Arc::downgrade(self);

        let task = tokio::spawn(run_periodic(scheduler, generation, first_tick, interval));
        *periodic = Some(PeriodicRun { generation, crop, task });

        info!(
            "Periodic capture started for {} every {}ms",
            crop,
            interval.as_millis()
        );
        Ok(())
    }

    /// Stop periodic capture. Once this returns no further tick dispatches.
    /// A submission already in flight is left to settle.
    pub fn stop_periodic(&self) -> bool {
        match self.periodic.lock().take() {
            Some(run) => {
                run.task.abort();
                info!("Periodic capture stopped");
                true
            }
            None => false,
        }
    }

    /// Capture one frame now and submit it
    pub fn trigger_once(
        &self,
        selection: Option<Crop>,
        on_settled: Option<SettledCallback>,
    ) -> Result<SubmissionHandle, CaptureError> {
        // Held so periodic capture cannot start while this dispatches
        let periodic = self.periodic.lock();
        if periodic.is_some() {
            return Err(CaptureError::precondition(
                "Single capture is unavailable while realtime detection is active",
            ));
        }
        let crop = selection
            .ok_or_else(|| CaptureError::precondition("Please select a crop and ensure camera is active"))?;
        if !self.frames.is_open() {
            return Err(CaptureError::precondition(
                "Please select a crop and ensure camera is active",
            ));
        }
        if self.is_in_flight() {
            return Err(CaptureError::precondition("A submission is already in progress"));
        }

        let frame = self
            .frames
            .capture()
            .ok_or_else(|| CaptureError::DeviceUnavailable("Failed to capture frame".to_string()))?;

        self.dispatch(SubmissionRequest::new(frame, crop), TriggerMode::OneShot, on_settled)
    }

    /// Submit an externally supplied image. Does not need the camera.
    pub fn upload(
        &self,
        selection: Option<Crop>,
        frame: Frame,
        on_settled: Option<SettledCallback>,
    ) -> Result<SubmissionHandle, CaptureError> {
        let periodic = self.periodic.lock();
        if periodic.is_some() {
            return Err(CaptureError::precondition(
                "Upload is unavailable while realtime detection is active",
            ));
        }
        let crop = selection.ok_or_else(|| CaptureError::precondition("Please select a crop first"))?;

        self.dispatch(SubmissionRequest::new(frame, crop), TriggerMode::Upload, on_settled)
    }

    pub fn is_periodic_active(&self) -> bool {
        self.periodic.lock().is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Successful periodic results delivered since periodic capture last started
    pub fn frames_processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns false once the run that owns `generation` is gone
    fn tick(&self, generation: u64) -> bool {
        let periodic = self.periodic.lock();
        let crop = match periodic.as_ref() {
            Some(run) if run.generation == generation => run.crop,
            _ => return false,
        };

        if self.is_in_flight() {
            debug!("Previous submission still outstanding, skipping tick");
            self.events.publish(SessionEvent::TickSkipped);
            return true;
        }

        let Some(frame) = self.frames.capture() else {
            warn!("No frame available, skipping tick");
            return true;
        };

        if let Err(e) = self.dispatch(SubmissionRequest::new(frame, crop), TriggerMode::Periodic, None) {
            debug!("Tick not dispatched: {}", e);
        }
        true
    }

    fn dispatch(
        &self,
        request: SubmissionRequest,
        mode: TriggerMode,
        on_settled: Option<SettledCallback>,
    ) -> Result<SubmissionHandle, CaptureError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::precondition("A submission is already in progress"));
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let ticket = self.gate.ticket();
        let transport = self.transport.clone();
        let sink = self.sink.clone();
        let gate = self.gate.clone();
        let events = self.events.clone();
        let processed = self.processed.clone();

        debug!("Dispatching {:?} submission for {}", mode, request.crop);

        let task = tokio::spawn(async move {
            let outcome = transport.submit(request).await;

            if gate.admits(ticket) {
                match &outcome {
                    Ok(DetectionResult::Detected(detection)) => {
                        sink.on_result(detection.clone());
                        if mode == TriggerMode::Periodic {
                            let count = processed.fetch_add(1, Ordering::SeqCst) + 1;
                            events.publish(SessionEvent::FrameProcessed { count });
                        }
                    }
                    Ok(DetectionResult::Failed { error }) => {
                        sink.on_error(&CaptureError::BackendError(error.clone()));
                    }
                    Err(e) => sink.on_error(e),
                }
            } else {
                debug!("Discarding {:?} outcome from a previous epoch", mode);
            }

            drop(guard);
            if let Some(on_settled) = on_settled {
                on_settled();
            }
            outcome
        });

        Ok(SubmissionHandle { mode, task })
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        if let Some(run) = self.periodic.get_mut().take() {
            run.task.abort();
        }
    }
}

async fn run_periodic(
    owner: Weak<CaptureScheduler>,
    generation: u64,
    first_tick: Instant,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(scheduler) = owner.upgrade() else {
            break;
        };
        if !scheduler.tick(generation) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraBackend, CameraDevice};
    use crate::transport::TransportKind;
    use async_trait::async_trait;
    use minori_core::{CameraConfig, Detection};
    use std::sync::atomic::AtomicUsize;

    struct TestCamera;

    struct TestDevice;

    impl CameraDevice for TestDevice {
        fn grab(&mut self) -> Result<Frame, CaptureError> {
            Ok(Frame::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]))
        }

        fn release(&mut self) {}
    }

    impl CameraBackend for TestCamera {
        fn open(&self, _config: &CameraConfig) -> Result<Box<dyn CameraDevice>, CaptureError> {
            Ok(Box::new(TestDevice))
        }

        fn name(&self) -> String {
            "test".to_string()
        }
    }

    /// Answers each submission after `delay` with a result naming the call
    struct SlowTransport {
        delay: Duration,
        calls: AtomicUsize,
        outstanding: AtomicUsize,
        max_outstanding: AtomicUsize,
    }

    impl SlowTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                max_outstanding: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FrameTransport for SlowTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Discrete
        }

        async fn submit(&self, request: SubmissionRequest) -> Result<DetectionResult, CaptureError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_outstanding.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            Ok(DetectionResult::Detected(Detection {
                crop: request.crop.to_string(),
                detected_disease: format!("result_{}", call),
                solution: "none".to_string(),
                processing_time: Some(0.1),
            }))
        }
    }

    async fn scheduler(transport: Arc<dyn FrameTransport>) -> (Arc<CaptureScheduler>, Arc<ResultSink>, Arc<DeliveryGate>) {
        let events = EventBus::default();
        let frames = Arc::new(FrameSource::new(Arc::new(TestCamera), CameraConfig::default()));
        frames.open().await.unwrap();
        let sink = Arc::new(ResultSink::new(events.clone()));
        let gate = Arc::new(DeliveryGate::new());
        let scheduler = Arc::new(CaptureScheduler::new(
            frames,
            transport,
            sink.clone(),
            gate.clone(),
            events,
            Duration::from_millis(2000),
        ));
        (scheduler, sink, gate)
    }

    #[test]
    fn test_delivery_gate() {
        let gate = DeliveryGate::new();
        let ticket = gate.ticket();
        assert!(gate.admits(ticket));
        assert_eq!(gate.advance(), 1);
        assert!(!gate.admits(ticket));
        assert!(gate.admits(gate.ticket()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_three_ticks() {
        let transport = SlowTransport::new(Duration::from_millis(100));
        let (scheduler, sink, _) = scheduler(transport.clone()).await;

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        tokio::time::sleep(Duration::from_millis(6500)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.frames_processed(), 3);
        assert_eq!(sink.result().unwrap().detected_disease, "result_3");
        assert!(scheduler.stop_periodic());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport.clone()).await;

        scheduler.start_periodic(Some(Crop::Wheat)).unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_skips_ticks() {
        let transport = SlowTransport::new(Duration::from_millis(5000));
        let (scheduler, _, _) = scheduler(transport.clone()).await;
        let mut events = scheduler.events.subscribe();

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        // Ticks at 2s, 4s, 6s, 8s, 10s; 4s and 6s find the 2s submission
        // outstanding, 10s finds the 8s one.
        assert_eq!(transport.max_outstanding.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::TickSkipped) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport.clone()).await;

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(scheduler.stop_periodic());
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_periodic_active());
        assert!(!scheduler.stop_periodic());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_counter() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport.clone()).await;

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(scheduler.frames_processed(), 2);
        scheduler.stop_periodic();

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        assert_eq!(scheduler.frames_processed(), 0);
    }

    #[tokio::test]
    async fn test_periodic_requires_crop() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport).await;
        let err = scheduler.start_periodic(None).unwrap_err();
        assert!(matches!(err, CaptureError::PreconditionNotMet(_)));
        assert!(!scheduler.is_periodic_active());
    }

    #[tokio::test]
    async fn test_periodic_requires_open_camera() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport).await;
        scheduler.frames.close();
        let err = scheduler.start_periodic(Some(Crop::Rice)).unwrap_err();
        assert!(matches!(err, CaptureError::PreconditionNotMet(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_once_rejected_while_in_flight() {
        let transport = SlowTransport::new(Duration::from_millis(500));
        let (scheduler, sink, _) = scheduler(transport.clone()).await;

        let handle = scheduler.trigger_once(Some(Crop::Rice), None).unwrap();
        assert_eq!(handle.mode(), TriggerMode::OneShot);
        assert!(scheduler.is_in_flight());

        let err = scheduler.trigger_once(Some(Crop::Rice), None).unwrap_err();
        assert!(matches!(err, CaptureError::PreconditionNotMet(_)));

        let result = handle.wait().await.unwrap();
        assert!(result.is_success());
        assert!(!scheduler.is_in_flight());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        // One-shot results do not count as periodic frames
        assert_eq!(scheduler.frames_processed(), 0);
        assert!(sink.result().is_some());
    }

    #[tokio::test]
    async fn test_trigger_once_rejected_while_periodic() {
        let transport = SlowTransport::new(Duration::from_millis(10));
        let (scheduler, _, _) = scheduler(transport.clone()).await;

        scheduler.start_periodic(Some(Crop::Rice)).unwrap();
        assert!(scheduler.trigger_once(Some(Crop::Rice), None).is_err());
        assert!(scheduler
            .upload(Some(Crop::Rice), Frame::jpeg(vec![0xFF, 0xD8]), None)
            .is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upload_without_camera() {
        let transport = SlowTransport::new(Duration::from_millis(1));
        let (scheduler, sink, _) = scheduler(transport).await;
        scheduler.frames.close();

        let handle = scheduler
            .upload(Some(Crop::Wheat), Frame::jpeg(vec![0xFF, 0xD8]), None)
            .unwrap();
        assert_eq!(handle.mode(), TriggerMode::Upload);
        handle.wait().await.unwrap();
        assert_eq!(sink.result().unwrap().crop, "wheat");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_result_discarded() {
        let transport = SlowTransport::new(Duration::from_millis(500));
        let (scheduler, sink, gate) = scheduler(transport).await;

        let settled = Arc::new(AtomicBool::new(false));
        let flag = settled.clone();
        let handle = scheduler
            .trigger_once(
                Some(Crop::Rice),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        gate.advance();

        // The caller still sees the outcome, the sink does not
        assert!(handle.wait().await.unwrap().is_success());
        assert!(sink.result().is_none());
        assert!(settled.load(Ordering::SeqCst));
        assert!(!scheduler.is_in_flight());
    }

    #[tokio::test]
    async fn test_backend_failure_reaches_sink() {
        struct Refusing;

        #[async_trait]
        impl FrameTransport for Refusing {
            fn kind(&self) -> TransportKind {
                TransportKind::Discrete
            }

            async fn submit(&self, _request: SubmissionRequest) -> Result<DetectionResult, CaptureError> {
                Ok(DetectionResult::Failed {
                    error: "Unsupported crop".to_string(),
                })
            }
        }

        let (scheduler, sink, _) = scheduler(Arc::new(Refusing)).await;
        let handle = scheduler.trigger_once(Some(Crop::Wheat), None).unwrap();
        handle.wait().await.unwrap();

        let error = sink.error().unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::BackendError);
        assert_eq!(error.message, "Unsupported crop");
    }
}
