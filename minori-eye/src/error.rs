//! Error types for minori-eye

use minori_core::Error as CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    /// Camera permission denied or no device present
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// Action attempted without the required prior state
    #[error("{0}")]
    PreconditionNotMet(String),

    /// Realtime channel failed to connect or dropped
    #[error("Connection error: {0}")]
    TransportFailure(String),

    /// Well-formed backend reply reporting an inference failure
    #[error("{0}")]
    BackendError(String),

    /// Network-level failure of a discrete request
    #[error("Failed to process frame: {0}")]
    SubmissionFailure(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Core error: {0}")]
    Core(String),
}

/// Classification of a [`CaptureError`] for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DeviceUnavailable,
    PreconditionNotMet,
    TransportFailure,
    BackendError,
    SubmissionFailure,
    InvalidImage,
    Config,
    Io,
    Core,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            CaptureError::PreconditionNotMet(_) => ErrorKind::PreconditionNotMet,
            CaptureError::TransportFailure(_) => ErrorKind::TransportFailure,
            CaptureError::BackendError(_) => ErrorKind::BackendError,
            CaptureError::SubmissionFailure(_) => ErrorKind::SubmissionFailure,
            CaptureError::InvalidImage(_) => ErrorKind::InvalidImage,
            CaptureError::Config(_) => ErrorKind::Config,
            CaptureError::Io(_) => ErrorKind::Io,
            CaptureError::Core(_) => ErrorKind::Core,
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        CaptureError::PreconditionNotMet(msg.into())
    }
}

impl From<CoreError> for CaptureError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => CaptureError::PreconditionNotMet(msg),
            CoreError::Configuration(msg) => CaptureError::Config(msg),
            other => CaptureError::Core(other.to_string()),
        }
    }
}

impl From<minori_core::ConfigError> for CaptureError {
    fn from(err: minori_core::ConfigError) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::InvalidImage(err.to_string())
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for CaptureError {
    fn from(err: opencv::Error) -> Self {
        CaptureError::DeviceUnavailable(err.message)
    }
}
