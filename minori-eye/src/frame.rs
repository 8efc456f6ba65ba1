//! Encoded still frames and the submission unit sent to the backend

use crate::error::CaptureError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use minori_core::Crop;

/// Raster encodings the backend accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
    Bmp,
    Gif,
}

impl ImageKind {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Webp => "image/webp",
            ImageKind::Bmp => "image/bmp",
            ImageKind::Gif => "image/gif",
        }
    }

    fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Png => Some(ImageKind::Png),
            ImageFormat::WebP => Some(ImageKind::Webp),
            ImageFormat::Bmp => Some(ImageKind::Bmp),
            ImageFormat::Gif => Some(ImageKind::Gif),
            _ => None,
        }
    }
}

/// An immutable encoded still image
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    kind: ImageKind,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap JPEG bytes produced by a camera device
    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            kind: ImageKind::Jpeg,
            captured_at: Utc::now(),
        }
    }

    /// Validate an externally supplied image. The raster format is sniffed
    /// from the content, not taken from a file name.
    pub fn from_upload(data: impl Into<Bytes>, max_bytes: usize) -> Result<Self, CaptureError> {
        let data = data.into();
        if data.is_empty() {
            return Err(CaptureError::InvalidImage("image is empty".to_string()));
        }
        if data.len() > max_bytes {
            return Err(CaptureError::InvalidImage(format!(
                "image too large ({} bytes, max {} bytes)",
                data.len(),
                max_bytes
            )));
        }

        let format = image::guess_format(&data)
            .map_err(|_| CaptureError::InvalidImage("unrecognised image format".to_string()))?;
        let kind = ImageKind::from_format(format).ok_or_else(|| {
            CaptureError::InvalidImage(format!("unsupported image format {:?}", format))
        })?;

        Ok(Self {
            data,
            kind,
            captured_at: Utc::now(),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `data:<mime>;base64,<payload>`
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.kind.mime(), STANDARD.encode(&self.data))
    }
}

/// A frame paired with the crop it should be analysed for
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub frame: Frame,
    pub crop: Crop,
}

impl SubmissionRequest {
    pub fn new(frame: Frame, crop: Crop) -> Self {
        Self { frame, crop }
    }
}
