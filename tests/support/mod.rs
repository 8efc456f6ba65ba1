// In-process stand-in for the inference backend
//
// Serves the realtime socket and the discrete endpoint on a loopback port
// and counts what it receives.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{DynamicImage, ImageBuffer, Rgb};
use minori_core::{Crop, Detection, DetectionResponse, DiscreteRequest, FrameMessage, MinoriConfig, ServerMessage};
use minori_eye::{SessionController, StillImageBackend};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Accept realtime connections
    pub realtime: bool,
    /// Drop the socket on receiving this many realtime frames, unanswered
    pub drop_on_frame: Option<usize>,
    /// Simulated inference time
    pub delay: Duration,
    pub supported: Vec<Crop>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            drop_on_frame: None,
            delay: Duration::from_millis(20),
            supported: Crop::ALL.to_vec(),
        }
    }
}

#[derive(Default)]
pub struct BackendStats {
    pub connections: AtomicUsize,
    pub realtime_frames: AtomicUsize,
    pub discrete_frames: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub client_ids: Mutex<Vec<String>>,
}

impl BackendStats {
    pub fn total_frames(&self) -> usize {
        self.realtime_frames.load(Ordering::SeqCst) + self.discrete_frames.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    options: Arc<BackendOptions>,
    stats: Arc<BackendStats>,
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub stats: Arc<BackendStats>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start(options: BackendOptions) -> Self {
        let stats = Arc::new(BackendStats::default());
        let state = AppState {
            options: Arc::new(options),
            stats: stats.clone(),
        };

        let app = Router::new()
            .route("/ws/real-time-detection/:client_id", get(realtime_handler))
            .route("/process-frame", post(process_frame))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, stats, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client configuration pointing at this backend
    pub fn config(&self) -> MinoriConfig {
        let mut config = MinoriConfig::default();
        config.backend.base_url = self.base_url();
        config.backend.connect_timeout_ms = 2_000;
        config.backend.request_timeout_ms = 5_000;
        config.backend.response_timeout_ms = 5_000;
        config.capture.interval_ms = 200;
        config
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Session whose camera serves a small green still image
pub fn session(config: MinoriConfig) -> SessionController {
    let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(16, 12, Rgb([40u8, 150, 60])));
    let camera = Arc::new(StillImageBackend::from_image(image));
    SessionController::new(config, camera).unwrap()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn realtime_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if !state.options.realtime {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.stats.connections.fetch_add(1, Ordering::SeqCst);
    state.stats.client_ids.lock().push(client_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: FrameMessage = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };

        let received = state.stats.realtime_frames.fetch_add(1, Ordering::SeqCst) + 1;
        if state.options.drop_on_frame == Some(received) {
            // Dropped without a close frame
            return;
        }

        let response = detect(&state, &frame.frame, frame.crop).await;
        let reply = serde_json::to_string(&ServerMessage::result(response)).unwrap();
        if socket.send(Message::Text(reply)).await.is_err() {
            return;
        }
    }
}

async fn process_frame(State(state): State<AppState>, Json(request): Json<DiscreteRequest>) -> Json<DetectionResponse> {
    state.stats.discrete_frames.fetch_add(1, Ordering::SeqCst);
    Json(detect(&state, &request.frame, request.crop).await)
}

async fn detect(state: &AppState, frame: &str, crop: Crop) -> DetectionResponse {
    let stats = &state.stats;
    let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_active.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(state.options.delay).await;
    stats.active.fetch_sub(1, Ordering::SeqCst);

    if !frame.starts_with("data:image/") {
        return DetectionResponse::failed("Invalid image data");
    }
    if !state.options.supported.contains(&crop) {
        return DetectionResponse::failed(format!("Unsupported crop: {}", crop));
    }

    let disease = match crop {
        Crop::Rice => "brown_spot",
        Crop::Wheat => "healthy",
    };
    DetectionResponse::detected(&Detection {
        crop: crop.as_str().to_string(),
        detected_disease: disease.to_string(),
        solution: format!("Recommended treatment for {}", disease),
        processing_time: Some(state.options.delay.as_secs_f64()),
    })
}
