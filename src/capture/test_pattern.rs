//! Synthetic camera for test mode
//!
//! Renders a gradient with a bar that sweeps one step per frame, so a viewer
//! can tell at a glance that frames are flowing.

use bytes::Bytes;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::BTreeSet;

use super::{CameraBackend, CameraDevice, CaptureError};
use crate::config::Resolution;
use crate::transform;

const BAR_WIDTH: u32 = 16;
const BAR_STEP: u32 = 8;
const QUALITY: u8 = 80;

/// Backend whose "present" devices are a fixed index set
#[derive(Debug, Clone)]
pub struct TestPatternBackend {
    devices: BTreeSet<u32>,
    read_limit: Option<u64>,
}

impl TestPatternBackend {
    /// Single device at index 0
    pub fn new() -> Self {
        Self::with_devices([0])
    }

    pub fn with_devices(devices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            read_limit: None,
        }
    }

    /// Devices fail every read after `frames` good ones
    pub fn with_read_limit(mut self, frames: u64) -> Self {
        self.read_limit = Some(frames);
        self
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for TestPatternBackend {
    fn name(&self) -> &'static str {
        "test-pattern"
    }

    fn open(
        &self,
        index: u32,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        if !self.devices.contains(&index) {
            return Err(CaptureError::Open {
                device: format!("test-pattern:{}", index),
                reason: "no such device".into(),
            });
        }

        Ok(Box::new(TestPatternDevice {
            resolution,
            frame_no: 0,
            read_limit: self.read_limit,
        }))
    }

    fn probe(&self, index: u32) -> bool {
        self.devices.contains(&index)
    }
}

struct TestPatternDevice {
    resolution: Resolution,
    frame_no: u64,
    read_limit: Option<u64>,
}

impl TestPatternDevice {
    fn render(&self) -> DynamicImage {
        let Resolution { width, height } = self.resolution;
        let bar_x = (self.frame_no as u32).wrapping_mul(BAR_STEP) % width;

        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            if x >= bar_x && x < bar_x + BAR_WIDTH {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    (x * 255 / width) as u8,
                    (y * 255 / height) as u8,
                    96,
                ])
            }
        }))
    }
}

impl CameraDevice for TestPatternDevice {
    fn read_frame(&mut self) -> Result<Bytes, CaptureError> {
        if self.read_limit.is_some_and(|limit| self.frame_no >= limit) {
            return Err(CaptureError::Read("test pattern read limit reached".into()));
        }

        let frame = transform::encode_jpeg(&self.render(), QUALITY)?;
        self.frame_no += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_jpeg_at_resolution() {
        let backend = TestPatternBackend::new();
        let mut device = backend.open(0, Resolution::new(80, 60)).unwrap();

        let frame = device.read_frame().unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&frame).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (80, 60));
    }

    #[test]
    fn test_consecutive_frames_differ() {
        let backend = TestPatternBackend::new();
        let mut device = backend.open(0, Resolution::new(64, 32)).unwrap();
        let a = device.read_frame().unwrap();
        let b = device.read_frame().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_probe_and_open_respect_device_set() {
        let backend = TestPatternBackend::with_devices([1, 3]);
        assert!(!backend.probe(0));
        assert!(backend.probe(3));
        assert!(backend.open(2, Resolution::default()).is_err());
    }

    #[test]
    fn test_read_limit() {
        let backend = TestPatternBackend::new().with_read_limit(2);
        let mut device = backend.open(0, Resolution::new(16, 16)).unwrap();
        assert!(device.read_frame().is_ok());
        assert!(device.read_frame().is_ok());
        assert!(matches!(device.read_frame(), Err(CaptureError::Read(_))));
    }
}
