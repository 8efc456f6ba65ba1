//! Camera acquisition
//!
//! [`FrameSource`] owns the device handle for one session: it acquires the
//! device on `open`, hands out encoded frames on `capture`, and releases the
//! device on `close` or when dropped.

use crate::error::CaptureError;
use crate::frame::Frame;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage};
use minori_core::CameraConfig;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An acquired camera
#[cfg_attr(test, mockall::automock)]
pub trait CameraDevice: Send {
    /// Grab the current frame from the live feed, JPEG encoded
    fn grab(&mut self) -> Result<Frame, CaptureError>;

    /// Release the underlying device
    fn release(&mut self);
}

/// Something that can acquire a camera device
#[cfg_attr(test, mockall::automock)]
pub trait CameraBackend: Send + Sync {
    /// Acquire a device at the configured resolution and frame rate. May block.
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraDevice>, CaptureError>;

    fn name(&self) -> String;
}

/// Camera manager for one capture session
pub struct FrameSource {
    backend: Arc<dyn CameraBackend>,
    config: Arc<CameraConfig>,
    device: Mutex<Option<Box<dyn CameraDevice>>>,
}

impl FrameSource {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CameraConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            device: Mutex::new(None),
        }
    }

    /// Acquire the camera. Opening an already open source is a no-op.
    pub async fn open(&self) -> Result<(), CaptureError> {
        if self.is_open() {
            return Ok(());
        }

        let backend = self.backend.clone();
        let config = self.config.clone();
        let device = tokio::task::spawn_blocking(move || backend.open(&config))
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(format!("camera open task failed: {}", e)))??;

        let mut slot = self.device.lock();
        if slot.is_some() {
            // Another open won the race; keep the first device.
            let mut device = device;
            device.release();
            return Ok(());
        }
        *slot = Some(device);

        info!(
            "Camera '{}' opened at {}x{} @ {}fps",
            self.backend.name(),
            self.config.width,
            self.config.height,
            self.config.frame_rate
        );
        Ok(())
    }

    /// Capture a single frame, or `None` when the camera is not open or the
    /// device failed to deliver one.
    pub fn capture(&self) -> Option<Frame> {
        let mut slot = self.device.lock();
        let device = slot.as_mut()?;
        match device.grab() {
            Ok(frame) => {
                debug!("Captured frame ({} bytes)", frame.len());
                Some(frame)
            }
            Err(e) => {
                warn!("Camera read error: {}", e);
                None
            }
        }
    }

    /// Release the camera. Safe to call any number of times.
    pub fn close(&self) {
        if let Some(mut device) = self.device.lock().take() {
            device.release();
            info!("Camera '{}' released", self.backend.name());
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.lock().is_some()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serves a fixed still image as if it were a live feed. Used on hosts
/// without a camera and in tests.
pub struct StillImageBackend {
    image: Arc<DynamicImage>,
}

impl StillImageBackend {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CaptureError> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }
}

impl CameraBackend for StillImageBackend {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let jpeg = encode_jpeg(&self.image, config.jpeg_quality)?;
        Ok(Box::new(StillImageDevice { jpeg: Some(jpeg) }))
    }

    fn name(&self) -> String {
        format!("still {}x{}", self.image.width(), self.image.height())
    }
}

struct StillImageDevice {
    jpeg: Option<Bytes>,
}

impl CameraDevice for StillImageDevice {
    fn grab(&mut self) -> Result<Frame, CaptureError> {
        self.jpeg
            .clone()
            .map(Frame::jpeg)
            .ok_or_else(|| CaptureError::DeviceUnavailable("device released".to_string()))
    }

    fn release(&mut self) {
        self.jpeg = None;
    }
}

/// Encode an image as baseline JPEG
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Bytes, CaptureError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
    Ok(Bytes::from(buf))
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::OpenCvBackend;

#[cfg(feature = "opencv")]
mod opencv_backend {
    use super::*;
    use opencv::core::{Mat, Vector};
    use opencv::imgcodecs::{imencode, IMWRITE_JPEG_QUALITY};
    use opencv::prelude::*;
    use opencv::videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH};

    /// USB/V4L camera through OpenCV
    #[derive(Debug, Default)]
    pub struct OpenCvBackend;

    impl CameraBackend for OpenCvBackend {
        fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraDevice>, CaptureError> {
            let mut last_error = String::from("no camera device configured");

            for &id in &config.device_ids {
                let mut capture = match VideoCapture::new(id as i32, CAP_ANY) {
                    Ok(capture) => capture,
                    Err(e) => {
                        last_error = format!("camera {}: {}", id, e);
                        continue;
                    }
                };
                if !capture.is_opened().unwrap_or(false) {
                    last_error = format!("camera {} failed to open", id);
                    continue;
                }

                capture.set(CAP_PROP_FRAME_WIDTH, config.width as f64)?;
                capture.set(CAP_PROP_FRAME_HEIGHT, config.height as f64)?;
                capture.set(CAP_PROP_FPS, config.frame_rate as f64)?;

                debug!("Opened camera index {}", id);
                return Ok(Box::new(OpenCvDevice {
                    capture,
                    quality: config.jpeg_quality as i32,
                }));
            }

            Err(CaptureError::DeviceUnavailable(last_error))
        }

        fn name(&self) -> String {
            "opencv".to_string()
        }
    }

    struct OpenCvDevice {
        capture: VideoCapture,
        quality: i32,
    }

    impl CameraDevice for OpenCvDevice {
        fn grab(&mut self) -> Result<Frame, CaptureError> {
            let mut mat = Mat::default();
            if !self.capture.read(&mut mat)? || mat.empty() {
                return Err(CaptureError::DeviceUnavailable("Failed to capture frame".to_string()));
            }

            let mut buf = Vector::<u8>::new();
            let params = Vector::<i32>::from_slice(&[IMWRITE_JPEG_QUALITY, self.quality]);
            imencode(".jpg", &mat, &mut buf, &params)?;
            Ok(Frame::jpeg(buf.to_vec()))
        }

        fn release(&mut self) {
            if let Err(e) = self.capture.release() {
                warn!("Camera release error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn mock_device() -> MockCameraDevice {
        let mut device = MockCameraDevice::new();
        device
            .expect_grab()
            .returning(|| Ok(Frame::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9])));
        device.expect_release().times(1).return_const(());
        device
    }

    fn mock_backend() -> MockCameraBackend {
        let mut backend = MockCameraBackend::new();
        backend
            .expect_open()
            .times(1)
            .returning(|_| Ok(Box::new(mock_device())));
        backend.expect_name().return_const("mock".to_string());
        backend
    }

    #[tokio::test]
    async fn test_capture_requires_open() {
        let source = FrameSource::new(Arc::new(mock_backend()), CameraConfig::default());
        assert!(source.capture().is_none());

        source.open().await.unwrap();
        assert!(source.is_open());
        let frame = source.capture().unwrap();
        assert_eq!(frame.len(), 4);
    }

    #[tokio::test]
    async fn test_double_open_acquires_once() {
        let source = FrameSource::new(Arc::new(mock_backend()), CameraConfig::default());
        source.open().await.unwrap();
        source.open().await.unwrap();
        assert!(source.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source = FrameSource::new(Arc::new(mock_backend()), CameraConfig::default());
        source.open().await.unwrap();
        source.close();
        source.close();
        assert!(!source.is_open());
        assert!(source.capture().is_none());
    }

    #[tokio::test]
    async fn test_open_denied() {
        let mut backend = MockCameraBackend::new();
        backend
            .expect_open()
            .returning(|_| Err(CaptureError::DeviceUnavailable("permission denied".to_string())));
        backend.expect_name().return_const("denied".to_string());

        let source = FrameSource::new(Arc::new(backend), CameraConfig::default());
        let err = source.open().await.unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        // release().times(1) on the mock device is verified when it is dropped
        let source = FrameSource::new(Arc::new(mock_backend()), CameraConfig::default());
        source.open().await.unwrap();
        drop(source);
    }

    #[tokio::test]
    async fn test_grab_failure_yields_none() {
        let mut backend = MockCameraBackend::new();
        backend.expect_open().returning(|_| {
            let mut device = MockCameraDevice::new();
            device
                .expect_grab()
                .returning(|| Err(CaptureError::DeviceUnavailable("unplugged".to_string())));
            device.expect_release().return_const(());
            Ok(Box::new(device))
        });
        backend.expect_name().return_const("flaky".to_string());

        let source = FrameSource::new(Arc::new(backend), CameraConfig::default());
        source.open().await.unwrap();
        assert!(source.capture().is_none());
    }

    #[tokio::test]
    async fn test_still_image_backend() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 6, Rgb([30u8, 160, 40])));
        let backend = StillImageBackend::from_image(image);
        assert_eq!(backend.name(), "still 8x6");

        let source = FrameSource::new(Arc::new(backend), CameraConfig::default());
        source.open().await.unwrap();
        let frame = source.capture().unwrap();
        assert_eq!(&frame.data()[..2], &[0xFF, 0xD8]);
        assert_eq!(image::guess_format(frame.data()).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_still_image_rejects_garbage() {
        assert!(StillImageBackend::from_bytes(b"not an image").is_err());
    }
}
