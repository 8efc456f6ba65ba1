//! minori-core: shared building blocks of the Minori inference client
//!
//! Configuration loading, the registered crop set and the wire protocol
//! spoken with the inference backend.

pub mod config;
pub mod crop;
pub mod error;
pub mod protocol;

pub use config::{BackendConfig, CameraConfig, CaptureConfig, ConfigError, LoggingConfig, MinoriConfig};
pub use crop::Crop;
pub use error::{Error, Result};
pub use protocol::{
    Detection, DetectionResponse, DetectionResult, DiscreteRequest, FrameMessage, ServerMessage,
};
