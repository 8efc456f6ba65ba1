//! One HTTP request per frame

use super::{FrameTransport, TransportKind};
use crate::error::CaptureError;
use crate::frame::SubmissionRequest;
use async_trait::async_trait;
use minori_core::{BackendConfig, DetectionResponse, DetectionResult, DiscreteRequest};
use reqwest::Client;
use tracing::debug;

/// POSTs `{frame, crop}` to the backend's process-frame endpoint
pub struct DiscreteTransport {
    client: Client,
    url: String,
}

impl DiscreteTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, CaptureError> {
        let url = config.discrete_url()?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CaptureError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FrameTransport for DiscreteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Discrete
    }

    async fn submit(&self, request: SubmissionRequest) -> Result<DetectionResult, CaptureError> {
        let body = DiscreteRequest {
            frame: request.frame.to_data_url(),
            crop: request.crop,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaptureError::SubmissionFailure(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CaptureError::SubmissionFailure(e.to_string()))?;

        // Error statuses may still carry a detection payload with a message
        match serde_json::from_slice::<DetectionResponse>(&bytes) {
            Ok(payload) => {
                if !status.is_success() {
                    debug!("Backend answered {} with a detection payload", status);
                }
                Ok(payload.into_result())
            }
            Err(e) if status.is_success() => Err(CaptureError::SubmissionFailure(format!(
                "invalid response body: {}",
                e
            ))),
            Err(_) => Err(CaptureError::SubmissionFailure(format!(
                "backend returned {}",
                status
            ))),
        }
    }
}
