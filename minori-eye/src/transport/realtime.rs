//! Persistent websocket transport
//!
//! Frames go out as `{"type":"frame",...}` text messages and results come
//! back as `{"type":"result","data":...}`. Results carry no frame id, so
//! each one settles the oldest outstanding submission. That pairing only
//! holds while every frame gets its reply: a submission that times out
//! leaves a late reply on the wire, so the channel is dropped at that point
//! and later frames go over discrete requests.

use super::{ChannelState, FrameTransport, TransportKind};
use crate::error::CaptureError;
use crate::events::{EventBus, SessionEvent};
use crate::frame::SubmissionRequest;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use minori_core::{DetectionResult, FrameMessage, ServerMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<DetectionResult, CaptureError>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingResult {
    id: u64,
    reply: Reply,
}

struct Shared {
    pending: Mutex<VecDeque<PendingResult>>,
    open: AtomicBool,
    closing: AtomicBool,
    state: Arc<RwLock<ChannelState>>,
    events: EventBus,
}

impl Shared {
    fn new(state: Arc<RwLock<ChannelState>>, events: EventBus) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            state,
            events,
        }
    }

    fn settle_oldest(&self, outcome: Result<DetectionResult, CaptureError>) {
        match self.pending.lock().pop_front() {
            Some(pending) => {
                // Receiver gone means the submitter timed out already
                let _ = pending.reply.send(outcome);
            }
            None => debug!("Realtime result with no outstanding frame, ignoring"),
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        for pending in drained {
            let _ = pending
                .reply
                .send(Err(CaptureError::TransportFailure(reason.to_string())));
        }
    }

    fn forget(&self, id: u64) {
        self.pending.lock().retain(|pending| pending.id != id);
    }

    /// Mark the channel lost. Only the first call after the socket opened
    /// publishes a notice, and none does once a close was requested.
    fn lose(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.fail_all(reason);

        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("Realtime channel dropped: {}", reason);
        *self.state.write() = ChannelState::ClosedWithError(reason.to_string());
        self.events.publish(SessionEvent::ConnectivityNotice(format!(
            "Realtime connection lost ({}); using discrete requests",
            reason
        )));
    }
}

/// One open websocket to the backend
pub struct RealtimeTransport {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    response_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeTransport {
    /// Open the socket. `state` is set to `Open` on success and to
    /// `ClosedWithError` if the backend later drops the connection.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        response_timeout: Duration,
        state: Arc<RwLock<ChannelState>>,
        events: EventBus,
    ) -> Result<Self, CaptureError> {
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| CaptureError::TransportFailure("WebSocket connection timed out".to_string()))?
            .map_err(|e| CaptureError::TransportFailure(format!("Failed to connect WebSocket: {}", e)))?;

        let (writer, stream) = ws_stream.split();
        *state.write() = ChannelState::Open;
        let shared = Arc::new(Shared::new(state, events));

        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            shared,
            next_id: AtomicU64::new(0),
            response_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Close the socket and fail anything still waiting on it
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        self.shutdown().await;
        self.shared.fail_all("realtime channel closed");
    }

    async fn shutdown(&self) {
        {
            let mut writer = self.writer.lock().await;
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
                Ok(Ok(())) => debug!("WebSocket closed successfully"),
                Ok(Err(e)) => debug!("WebSocket close error: {}", e),
                Err(_) => warn!("WebSocket close timed out"),
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl FrameTransport for RealtimeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Realtime
    }

    async fn submit(&self, request: SubmissionRequest) -> Result<DetectionResult, CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::TransportFailure("realtime channel is not open".to_string()));
        }

        let message = FrameMessage::new(request.frame.to_data_url(), request.crop);
        let text = serde_json::to_string(&message).map_err(|e| CaptureError::Core(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, outcome) = oneshot::channel();
        self.shared.pending.lock().push_back(PendingResult { id, reply });

        // The reader clears `open` before draining, so either it sees this
        // entry or we see the closed flag here.
        if !self.is_open() {
            self.shared.forget(id);
            return Err(CaptureError::TransportFailure("realtime channel is not open".to_string()));
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Text(text)).await
        };
        if let Err(e) = sent {
            self.shared.forget(id);
            return Err(CaptureError::TransportFailure(format!("failed to send frame: {}", e)));
        }

        match tokio::time::timeout(self.response_timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CaptureError::TransportFailure(
                "realtime channel closed before a result arrived".to_string(),
            )),
            Err(_) => {
                // The late reply would settle the next frame
                let reason = format!("no result within {}ms", self.response_timeout.as_millis());
                self.shared.forget(id);
                self.shared.lose(&reason);
                self.shutdown().await;
                Err(CaptureError::SubmissionFailure(reason))
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::parse_result(&text) {
                Ok(Some(result)) => shared.settle_oldest(Ok(result)),
                Ok(None) => debug!("Ignoring non-result realtime message"),
                Err(e) => {
                    warn!("Malformed realtime message: {}", e);
                    shared.settle_oldest(Err(CaptureError::SubmissionFailure(format!(
                        "malformed result: {}",
                        e
                    ))));
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("closed by backend: {}", frame.reason)
                    }
                    _ => "closed by backend".to_string(),
                };
            }
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection lost".to_string(),
        }
    };

    shared.lose(&reason);
}
