//! Messages exchanged with the inference backend.
//!
//! The backend exposes two equivalent surfaces: a realtime socket carrying
//! `{"type": "frame", ...}` / `{"type": "result", "data": ...}` envelopes, and
//! a discrete request endpoint whose reply is the flat detection payload.

use crate::crop::Crop;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message type tag for frames sent over the realtime channel
pub const FRAME_MESSAGE: &str = "frame";
/// Message type tag for results received over the realtime channel
pub const RESULT_MESSAGE: &str = "result";

const GENERIC_FAILURE: &str = "Detection failed";

/// Outbound realtime frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Data URL of the encoded image
    pub frame: String,
    pub crop: Crop,
}

impl FrameMessage {
    pub fn new(frame: String, crop: Crop) -> Self {
        Self {
            kind: FRAME_MESSAGE.to_string(),
            frame,
            crop,
        }
    }
}

/// Body of a discrete request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteRequest {
    pub frame: String,
    pub crop: Crop,
}

/// Inbound realtime envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<DetectionResponse>,
}

impl ServerMessage {
    pub fn result(data: DetectionResponse) -> Self {
        Self {
            kind: RESULT_MESSAGE.to_string(),
            data: Some(data),
        }
    }

    /// Parse an inbound text frame. Returns `Ok(None)` for envelopes that do
    /// not carry a result.
    pub fn parse_result(text: &str) -> Result<Option<DetectionResult>> {
        let message: ServerMessage = serde_json::from_str(text)?;
        if message.kind != RESULT_MESSAGE {
            return Ok(None);
        }
        let data = message
            .data
            .ok_or_else(|| Error::Protocol("result message without data".to_string()))?;
        Ok(Some(data.into_result()))
    }
}

/// Flat detection payload as it appears on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_disease: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    /// Seconds spent on inference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResponse {
    pub fn detected(detection: &Detection) -> Self {
        Self {
            success: true,
            crop: Some(detection.crop.clone()),
            detected_disease: Some(detection.detected_disease.clone()),
            solution: Some(detection.solution.clone()),
            processing_time: detection.processing_time,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Interpret the payload. A successful reply missing any of its fields,
    /// or a failed reply without a message, is reported as a failure rather
    /// than dropped.
    pub fn into_result(self) -> DetectionResult {
        if self.success {
            match (self.crop, self.detected_disease, self.solution) {
                (Some(crop), Some(detected_disease), Some(solution)) => {
                    DetectionResult::Detected(Detection {
                        crop,
                        detected_disease,
                        solution,
                        processing_time: self.processing_time.filter(|t| t.is_finite() && *t >= 0.0),
                    })
                }
                _ => DetectionResult::Failed {
                    error: "Incomplete detection result".to_string(),
                },
            }
        } else {
            let error = self
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            DetectionResult::Failed { error }
        }
    }
}

/// A successful classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Crop identifier echoed by the backend
    pub crop: String,
    pub detected_disease: String,
    pub solution: String,
    pub processing_time: Option<f64>,
}

impl Detection {
    /// The label names a healthy plant
    pub fn is_healthy(&self) -> bool {
        self.detected_disease.to_ascii_lowercase().contains("healthy")
    }

    /// Label with underscores replaced and each word capitalised
    pub fn disease_display(&self) -> String {
        self.detected_disease
            .split(|c: char| c == '_' || c.is_whitespace())
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.flat_map(|c| c.to_lowercase()))
                        .collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `None` when the reported time does not fit a `Duration`
    pub fn processing_time(&self) -> Option<Duration> {
        self.processing_time
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// The echoed crop matches the given selection
    pub fn matches_crop(&self, crop: Crop) -> bool {
        self.crop.trim().eq_ignore_ascii_case(crop.as_str())
    }
}

/// Outcome of one well-formed backend exchange
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionResult {
    Detected(Detection),
    /// The backend answered but inference failed (unsupported crop, model error)
    Failed { error: String },
}

impl DetectionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DetectionResult::Detected(_))
    }

    pub fn detection(&self) -> Option<&Detection> {
        match self {
            DetectionResult::Detected(d) => Some(d),
            DetectionResult::Failed { .. } => None,
        }
    }
}

impl From<DetectionResponse> for DetectionResult {
    fn from(response: DetectionResponse) -> Self {
        response.into_result()
    }
}
