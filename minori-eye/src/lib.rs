//! minori-eye: capture side of the Minori inference client
//!
//! Acquires frames from a camera or an uploaded file, submits them to the
//! inference backend over a realtime socket or discrete requests, and
//! tracks the capture session as a small state machine.

pub mod camera;
pub mod error;
pub mod events;
pub mod frame;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod transport;

pub use camera::{CameraBackend, CameraDevice, FrameSource, StillImageBackend};
#[cfg(feature = "opencv")]
pub use camera::OpenCvBackend;
pub use error::{CaptureError, ErrorKind};
pub use events::{EventBus, SessionEvent};
pub use frame::{Frame, ImageKind, SubmissionRequest};
pub use scheduler::{CaptureScheduler, DeliveryGate, SubmissionHandle, TriggerMode};
pub use session::{SessionController, SessionState};
pub use sink::{Latest, ReportedError, ResultSink, SinkSnapshot};
pub use transport::{
    ChannelState, DiscreteTransport, FrameTransport, RealtimeTransport, TransportChannel, TransportKind,
};
